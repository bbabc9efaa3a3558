//! `__type__` discriminants carried by serialized records so that a persisted
//! snapshot can be reconstructed faithfully.

macro_rules! record_tag {
    ($name:ident, $literal:literal) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name;

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($literal)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                if value == $literal {
                    Ok($name)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&value),
                        &$literal,
                    ))
                }
            }
        }
    };
}

record_tag!(NodeTag, "Node");
record_tag!(CrawlStrategyTag, "CrawlStrategy");
record_tag!(ProtocolTag, "Protocol");
