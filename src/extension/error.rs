//! Extension registry error taxonomy.

use std::path::PathBuf;

use snafu::Snafu;

/// Everything that can go wrong while loading, composing, or dispatching
/// extensions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExtensionError {
    /// The capability type is not declared anywhere: it ships no embedded
    /// manifest and no manifest file for it exists under any configured root.
    #[snafu(display("{type_path} is not an extension point: no manifest declares it"))]
    NotAnExtensionPoint { type_path: String },

    /// Lookup of a name no manifest maps for this capability.
    #[snafu(display("no extension named {name:?} for {type_path}"))]
    NoSuchExtension { type_path: String, name: String },

    /// Two manifest entries map the same name to different providers.
    #[snafu(display(
        "duplicate extension name {name:?} for {type_path}: {existing} vs {conflicting}"
    ))]
    DuplicateExtension {
        type_path: String,
        name: String,
        existing: String,
        conflicting: String,
    },

    /// A manifest entry references a provider path the capability does not
    /// compile in.
    #[snafu(display("manifest for {type_path} references unknown provider {provider_path}"))]
    UnknownProvider { type_path: String, provider_path: String },

    /// More than one provider registered as the adaptive implementation.
    #[snafu(display("{type_path} declares more than one adaptive implementation"))]
    DuplicateAdaptive { type_path: String },

    /// An adaptive method was called without any URL to resolve against.
    #[snafu(display("no URL available to resolve adaptive {type_path}::{method}"))]
    AdaptiveUrlMissing { type_path: String, method: String },

    /// The URL carried none of the declared keys and the capability has no
    /// default extension.
    #[snafu(display(
        "cannot resolve an extension name for adaptive {type_path}::{method} \
         from url {url} (keys {keys:?}, no default)"
    ))]
    AdaptiveNameUnresolved {
        type_path: String,
        method: String,
        keys: Vec<String>,
        url: String,
    },

    /// `adaptive()` on a capability that neither declares an adaptive
    /// implementation nor has adaptive methods to synthesize one from.
    #[snafu(display("{type_path} has no adaptive methods"))]
    NoAdaptiveMethod { type_path: String },

    /// A non-adaptive method was called on a synthetic adaptive instance.
    #[snafu(display("{type_path}::{method} is not adaptive"))]
    NonAdaptiveMethod { type_path: String, method: String },

    /// A provider constructor failed.
    #[snafu(display("failed to construct extension {name:?} of {type_path}: {message}"))]
    CreationFailed {
        type_path: String,
        name: String,
        message: String,
    },

    /// A manifest file exists but could not be read.
    #[snafu(display("failed to read manifest {}: {source}", path.display()))]
    ManifestIo { path: PathBuf, source: std::io::Error },
}
