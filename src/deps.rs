//! Shared-library dependency resolution boundary.
//!
//! Turning declared libraries into a load order is someone else's job; the
//! gate consumes a `DependencyResolver` and only cares about its output:
//! files to preload, load directives for the configuration file, and a url
//! map for the engine's file locator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::PreloadFile;
use crate::error::GateResult;

/// A shared library declared by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedLib {
    /// Location of the library: a url or a path the engine can resolve.
    pub url: String,
    /// Load via a preloaded file named after the url's final path segment.
    #[serde(default)]
    pub ini: bool,
}

impl SharedLib {
    /// Library fetched from a url.
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ini: false,
        }
    }

    /// Ini fragment fetched from a url.
    pub fn ini(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ini: true,
        }
    }
}

/// How one resolved library is loaded by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoadDirective {
    /// A path the engine resolves itself.
    Path(String),
    /// A remote location.
    Url(String),
    /// A library preloaded into the virtual filesystem, referenced by file name.
    Ini { url: String },
}

/// Output of dependency resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Files to preload before the engine starts.
    pub files: Vec<PreloadFile>,
    /// Directives added to the engine config.
    pub libs: Vec<LoadDirective>,
    /// File name to url mapping for the locator.
    pub url_libs: HashMap<String, String>,
}

/// Context handed to the resolver.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    /// Directory preloaded libraries are placed in.
    pub preload_dir: &'a str,
}

/// Resolves declared libraries into files, directives and a url map.
pub trait DependencyResolver: Send + Sync {
    /// Resolves `declared` into a single flat resolution.
    fn resolve(&self, declared: &[SharedLib], ctx: ResolveContext<'_>) -> GateResult<Resolution>;
}

/// Final path segment of a url or path.
#[must_use]
pub fn file_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Maps each declared library directly, without transitive dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatResolver;

impl DependencyResolver for FlatResolver {
    fn resolve(&self, declared: &[SharedLib], ctx: ResolveContext<'_>) -> GateResult<Resolution> {
        let mut resolution = Resolution::default();

        for lib in declared {
            if lib.ini {
                resolution
                    .files
                    .push(PreloadFile::new(ctx.preload_dir, file_name(&lib.url), lib.url.clone()));
                resolution.libs.push(LoadDirective::Ini { url: lib.url.clone() });
            } else if lib.url.contains("://") {
                resolution
                    .url_libs
                    .insert(file_name(&lib.url).to_string(), lib.url.clone());
                resolution.libs.push(LoadDirective::Url(lib.url.clone()));
            } else {
                resolution.libs.push(LoadDirective::Path(lib.url.clone()));
            }
        }

        Ok(resolution)
    }
}
