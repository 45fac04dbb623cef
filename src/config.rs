//! Host-supplied configuration for [`crate::context::Context::new`].
//!
//! The subsystem itself never reads the environment or a CLI — see the
//! crate's non-goals — this is plain data the embedding host constructs and
//! hands in.

/// Which default feature set the subsystem should run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Profile {
    #[cfg_attr(not(debug_assertions), default)]
    Release,
    #[cfg_attr(debug_assertions, default)]
    Dev,
}

/// A named, forward-compatible feature toggle.
///
/// The core subsystem does not define any features of its own today; this
/// exists so hosts can pass feature requests through without the crate
/// needing a breaking change to recognize new ones later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureRequest {
    pub name: String,
    pub required: bool,
}

/// Configuration passed to [`crate::context::Context::new`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    profile: Profile,
    /// Overrides the root directory under which the subsystem creates its
    /// private temporary directory (see [`crate::module::handle::ModuleHandle`]).
    /// Defaults to the platform temp directory when unset.
    temp_dir_root: Option<std::path::PathBuf>,
    features: Vec<FeatureRequest>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_temp_dir_root(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.temp_dir_root = Some(path.into());
        self
    }

    pub fn with_features(mut self, features: Vec<FeatureRequest>) -> Self {
        self.features = features;
        self
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn temp_dir_root(&self) -> Option<&std::path::Path> {
        self.temp_dir_root.as_deref()
    }

    pub fn features(&self) -> &[FeatureRequest] {
        &self.features
    }
}
