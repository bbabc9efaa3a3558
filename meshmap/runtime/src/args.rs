use crate::LASTRUN_FILE;
use anyhow::{Context, Result};
use clap::Parser;
use meshmap_core::{
    CrawlConfig, ProviderRegistry, Tree, PROVIDER_HINT, PROVIDER_SEED, PROVIDER_SSH,
};
use meshmap_engine::CrawlSession;
use meshmap_providers::{
    HintProvider, K8sConfig, K8sProvider, SeedProvider, SshConfig, SshProvider,
};
use meshmap_render::{snapshot, RenderContext, Renderer, RendererRegistry, Snapshot};
use std::{io::Write, path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "meshmap",
    about = "Crawls a service mesh from seed nodes and maps its runtime topology"
)]
pub struct Args {
    /// Log filter, e.g. "meshmap=debug,info".
    #[clap(long, default_value = "info", env = "MESHMAP_LOG")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Crawl a network of services outward from one or more seeds.
    Spider(SpiderArgs),
    /// Render the results of a previous crawl from its snapshot.
    Render(RenderArgs),
}

#[derive(Debug, clap::Args)]
struct CommonArgs {
    /// Directory holding the web document and strategy documents.
    #[clap(long, default_value = meshmap_config::DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Directory receiving rendered outputs and the last-run snapshot.
    #[clap(long, default_value = "outputs")]
    outputs_dir: PathBuf,

    /// Hide defunct (unused) connections.
    #[clap(long, short = 'D')]
    hide_defunct: bool,

    /// Formats to render the final graph in (ascii, text, json, dot).
    #[clap(long, short = 'o', num_args = 1..)]
    output: Vec<String>,

    /// Verbose mode for the ascii renderer.
    #[clap(long)]
    render_ascii_verbose: bool,

    /// Layout direction for the dot renderer (LR or TB; automatic when
    /// unset).
    #[clap(long)]
    render_dot_rankdir: Option<String>,

    /// Services to highlight in the dot renderer.
    #[clap(long, num_args = 1..)]
    render_dot_highlight: Vec<String>,
}

#[derive(Debug, clap::Args)]
struct SpiderArgs {
    #[clap(flatten)]
    common: CommonArgs,

    /// Seed host(s) to begin crawling, in provider:address form, e.g.
    /// "ssh:10.0.0.42" or "k8s:widget-machine-5b5bc8f67f-2qmkp".
    #[clap(long, short = 's', required = true, num_args = 1..)]
    seeds: Vec<String>,

    /// Max tree depth to crawl.
    #[clap(long, short = 'd', default_value_t = meshmap_core::config::DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Per-provider-call timeout, in seconds.
    #[clap(long, default_value_t = meshmap_core::config::DEFAULT_TIMEOUT_SECS)]
    timeout: f64,

    /// Do not initialize or crawl with these providers.
    #[clap(long, short = 'X', num_args = 1..)]
    disable_providers: Vec<String>,

    /// Protocols to skip crawling entirely.
    #[clap(long, short = 'P', num_args = 1..)]
    skip_protocols: Vec<String>,

    /// Protocol muxes to skip (substring match).
    #[clap(long, short = 'M', num_args = 1..)]
    skip_protocol_muxes: Vec<String>,

    /// Skip crawling of non-blocking children unless they are direct
    /// children of the seed nodes.
    #[clap(long, short = 'G')]
    skip_nonblocking_grandchildren: bool,

    /// Obfuscate graph details. Useful for sharing rendered output outside
    /// of trusted organizations.
    #[clap(long, short = 'x')]
    obfuscate: bool,

    /// Do not render live output to stderr while crawling.
    #[clap(long, short = 'q')]
    quiet: bool,

    #[clap(flatten)]
    ssh: SshArgs,

    #[clap(flatten)]
    k8s: K8sArgs,
}

#[derive(Debug, clap::Args)]
struct SshArgs {
    /// Command the ssh provider runs on a host to resolve its service name.
    #[clap(long = "ssh-name-command", default_value = "hostname")]
    name_command: String,

    /// ssh config file consulted for bastion/jump routing.
    #[clap(long = "ssh-config-file", default_value = "~/.ssh/config")]
    config_file: String,

    /// Max number of concurrent ssh sessions.
    #[clap(long = "ssh-concurrency", default_value_t = 10)]
    concurrency: usize,

    /// ConnectTimeout for the ssh client, in seconds.
    #[clap(long = "ssh-connect-timeout", default_value_t = 5)]
    connect_timeout: u64,
}

#[derive(Debug, clap::Args)]
struct K8sArgs {
    /// Namespace in which to discover services.
    #[clap(long = "k8s-namespace", default_value = "default")]
    namespace: String,

    /// Pod label associated with the service name.
    #[clap(long = "k8s-service-name-label", default_value = "app")]
    service_name_label: String,

    /// Ignore these containers during discovery (substring match).
    #[clap(long = "k8s-skip-containers", num_args = 1..)]
    skip_containers: Vec<String>,

    /// Additional LABEL=VALUE pairs to filter hint instances by.
    #[clap(long = "k8s-label-selectors", num_args = 1..)]
    label_selectors: Vec<String>,
}

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let filter = EnvFilter::try_new(&self.log_level)
            .with_context(|| format!("invalid log filter `{}`", self.log_level))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();

        // SIGINT terminates immediately, mid-crawl included.
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(0);
            }
        });

        match self.command {
            Command::Spider(args) => spider(args).await,
            Command::Render(args) => render(args).await,
        }
    }
}

#[derive(Debug, clap::Args)]
struct RenderArgs {
    #[clap(flatten)]
    common: CommonArgs,

    /// Load and render this snapshot instead of the last run's.
    #[clap(long, short = 'f')]
    json_file: Option<PathBuf>,
}

async fn spider(args: SpiderArgs) -> Result<()> {
    let (web, strategies) = meshmap_config::load_dir(&args.common.config_dir)?;

    let mut config = CrawlConfig {
        seeds: args.seeds,
        max_depth: args.max_depth,
        timeout_secs: args.timeout,
        disable_providers: args.disable_providers,
        skip_protocols: args.skip_protocols,
        skip_protocol_muxes: args.skip_protocol_muxes,
        skip_nonblocking_grandchildren: args.skip_nonblocking_grandchildren,
        obfuscate: args.obfuscate,
        quiet: args.quiet,
        hide_defunct: args.common.hide_defunct,
        output: args.common.output,
        render_ascii_verbose: args.common.render_ascii_verbose,
        render_dot_rankdir: args.common.render_dot_rankdir,
        render_dot_highlight: args.common.render_dot_highlight,
    };

    let mut providers = ProviderRegistry::new("provider");
    providers.register(PROVIDER_SEED, Arc::new(SeedProvider))?;
    providers.register(PROVIDER_HINT, Arc::new(HintProvider))?;
    providers.register(
        PROVIDER_SSH,
        Arc::new(SshProvider::new(SshConfig {
            name_command: args.ssh.name_command,
            config_file: args.ssh.config_file,
            concurrency: args.ssh.concurrency,
            connect_timeout_secs: args.ssh.connect_timeout,
        })),
    )?;
    // Registered even when disabled: `--disable-providers` only drives the
    // exclusion and hint-skip logic, never registry membership.
    let k8s_config = K8sConfig {
        namespace: args.k8s.namespace,
        service_name_label: args.k8s.service_name_label,
        skip_containers: args.k8s.skip_containers,
        label_selectors: args.k8s.label_selectors,
    };
    match K8sProvider::new(k8s_config).await {
        Ok(provider) => providers.register("k8s", Arc::new(provider))?,
        Err(error) => {
            tracing::warn!(%error, "kubernetes provider unavailable, disabling it");
            if !config.provider_disabled("k8s") {
                config.disable_providers.push("k8s".to_string());
            }
        }
    }

    std::fs::create_dir_all(&args.common.outputs_dir).with_context(|| {
        format!(
            "creating outputs directory {}",
            args.common.outputs_dir.display()
        )
    })?;

    let session = CrawlSession::new(config.clone(), web.clone(), strategies, providers);
    let tree = session.seed_tree()?;

    // The live renderer shares the tree the engine mutates; on --quiet it
    // still runs against a sink so replay pacing stays identical.
    let live_ctx = RenderContext {
        config: config.clone(),
        web: web.clone(),
        outputs_dir: args.common.outputs_dir.clone(),
    };
    let live_tree = tree.clone();
    let quiet = config.quiet;
    let live_render = tokio::spawn(async move {
        let mut out: Box<dyn Write + Send> = if quiet {
            Box::new(std::io::sink())
        } else {
            Box::new(std::io::stderr())
        };
        meshmap_render::ascii::render_tree(&live_tree, &live_ctx, out.as_mut(), true).await
    });

    match meshmap_engine::spider(&session, &tree).await {
        Ok(()) => {
            live_render.await.context("joining the live renderer")??;
        }
        Err(error) => {
            live_render.abort();
            return Err(error.into());
        }
    }

    snapshot::dump(
        &Snapshot::new(&config, &tree),
        &args.common.outputs_dir.join(LASTRUN_FILE),
    )?;

    let ctx = RenderContext {
        config: config.clone(),
        web,
        outputs_dir: args.common.outputs_dir,
    };
    run_renderers(&tree, &ctx).await
}

async fn render(args: RenderArgs) -> Result<()> {
    let (web, _strategies) = meshmap_config::load_dir(&args.common.config_dir)?;

    let path = args
        .json_file
        .unwrap_or_else(|| args.common.outputs_dir.join(LASTRUN_FILE));
    let loaded = snapshot::load(&path)?;

    let output = if args.common.output.is_empty() {
        vec!["ascii".to_string()]
    } else {
        args.common.output
    };
    let config = CrawlConfig {
        max_depth: loaded.args.max_depth,
        skip_nonblocking_grandchildren: loaded.args.skip_nonblocking_grandchildren,
        hide_defunct: args.common.hide_defunct,
        output,
        render_ascii_verbose: args.common.render_ascii_verbose,
        render_dot_rankdir: args.common.render_dot_rankdir,
        render_dot_highlight: args.common.render_dot_highlight,
        ..CrawlConfig::default()
    };

    std::fs::create_dir_all(&args.common.outputs_dir).with_context(|| {
        format!(
            "creating outputs directory {}",
            args.common.outputs_dir.display()
        )
    })?;

    let ctx = RenderContext {
        config,
        web,
        outputs_dir: args.common.outputs_dir,
    };
    run_renderers(&loaded.tree, &ctx).await
}

async fn run_renderers(tree: &Tree, ctx: &RenderContext) -> Result<()> {
    let mut renderers = RendererRegistry::new("renderer");
    meshmap_render::register_builtin(&mut renderers)?;

    for output in &ctx.config.output {
        let renderer: Arc<dyn Renderer> = renderers.get(output)?;
        tracing::debug!(renderer = %output, "rendering output");
        renderer.render(tree, ctx).await?;
    }
    Ok(())
}
