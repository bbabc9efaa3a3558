#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The traversal engine: a breadth-layered, cache-coordinated, bounded-depth
//! concurrent crawl over the provider capability interface.

mod crawl;
pub mod obfuscate;
mod session;

pub use self::{
    crawl::{crawl, spider, CrawlError},
    obfuscate::Obfuscator,
    session::CrawlSession,
};

#[cfg(test)]
mod tests;
