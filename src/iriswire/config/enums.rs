use serde::Deserialize;
use strum::{Display, EnumString};

/// Authentication exchange used for every incoming connection.
/// One variant is active per server instance.
#[derive(Deserialize, Display, EnumString, Clone, Copy, Eq, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AuthMode {
    Trust,
    Scram,
    Oauth,
    Gssapi,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::Trust
    }
}

/// What to do when the translator meets a construct it has no rule for.
#[derive(Deserialize, Display, EnumString, Clone, Copy, Eq, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TranslationPolicy {
    /// Abort the statement with SQLSTATE 0A000.
    Error,
    /// Emit a NoticeResponse and pass the original SQL through.
    Warning,
    /// Silent pass-through.
    Ignore,
    /// Error for administrative verbs, warning for unknown functions,
    /// standard SQL always passes.
    Hybrid,
}

impl Default for TranslationPolicy {
    fn default() -> Self {
        TranslationPolicy::Hybrid
    }
}

/// How the bridge reaches IRIS. The external mode requires the embedding
/// host to register a connector; the memory engine is for development
/// and the test suite.
#[derive(Deserialize, Display, EnumString, Clone, Copy, Eq, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IrisMode {
    Memory,
    External,
}

impl Default for IrisMode {
    fn default() -> Self {
        IrisMode::Memory
    }
}
