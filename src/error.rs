/// Convenience result type used across the crate.
pub type UpliftResult<T> = Result<T, UpliftError>;

/// Error taxonomy for template loading, capture and generation.
#[derive(thiserror::Error, Debug)]
pub enum UpliftError {
    /// The job template is missing or is not a valid graph (or its sidecar is invalid).
    #[error("template load error: {0}")]
    TemplateLoad(String),

    /// No parameter specification could be derived for a template.
    #[error("spec derivation error: {0}")]
    SpecDerivation(String),

    /// A required image parameter has no captured buffer.
    #[error("missing buffer for control '{0}'")]
    MissingBuffer(String),

    /// The pixel decoder cannot interpret a capture format.
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// Raw pixel data could not be decoded or encoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Polling exhausted its attempt budget.
    #[error("generation timed out after {attempts} attempts: {cause}")]
    GenerationTimeout { attempts: u32, cause: String },

    /// The job finished without any recoverable image.
    #[error("job completed without output images")]
    NoOutput,

    /// Unknown parameter name or value of the wrong type.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The remote backend rejected a request or returned malformed data.
    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpliftError {
    pub fn template_load(msg: impl Into<String>) -> Self {
        Self::TemplateLoad(msg.into())
    }

    pub fn spec_derivation(msg: impl Into<String>) -> Self {
        Self::SpecDerivation(msg.into())
    }

    pub fn unsupported_format(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn parameter(msg: impl Into<String>) -> Self {
        Self::Parameter(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
