pub mod catalog;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use catalog::{StationEntry, StreamCatalog};

/// Stream listo para reproducir: nombre para mostrar + URL real.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedStream {
    pub name: String,
    pub url: String,
}

impl ResolvedStream {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Un stream directo (sin entrada en el catálogo) se muestra con su URL.
    pub fn is_direct(&self) -> bool {
        self.name == self.url
    }
}

impl fmt::Display for ResolvedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Verifica que el texto sea una URL http(s) con host.
pub fn is_stream_url(candidate: &str) -> bool {
    url::Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
        .unwrap_or(false)
}
