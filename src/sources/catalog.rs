use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use super::{is_stream_url, ResolvedStream};
use crate::error::SessionError;

/// Entrada del catálogo de radios predefinidas.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StationEntry {
    pub url: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    streams: BTreeMap<String, StationEntry>,
}

/// Catálogo de radios predefinidas, indexado por nombre.
///
/// Se carga desde un archivo (TOML, JSON o YAML) con la forma:
///
/// ```toml
/// [streams.radio-one]
/// url = "https://radio.example.com/live"
/// desc = "Jazz las 24 horas"
/// ```
#[derive(Debug, Clone, Default)]
pub struct StreamCatalog {
    stations: BTreeMap<String, StationEntry>,
}

impl StreamCatalog {
    pub fn new(stations: BTreeMap<String, StationEntry>) -> Self {
        let stations = stations
            .into_iter()
            .filter(|(name, entry)| {
                let valid = is_stream_url(&entry.url);
                if !valid {
                    warn!("⚠️ Radio '{}' ignorada: URL inválida {:?}", name, entry.url);
                }
                valid
            })
            .collect();

        Self { stations }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "⚠️ Catálogo {} no encontrado, solo se aceptarán URLs directas",
                path.display()
            );
            return Ok(Self::default());
        }

        let file: CatalogFile = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("Error leyendo catálogo {}", path.display()))?;

        let catalog = Self::new(file.streams);
        info!("📻 Catálogo cargado con {} radio(s)", catalog.len());
        Ok(catalog)
    }

    /// Resuelve lo que escribió el usuario a un stream reproducible.
    ///
    /// Primero busca un nombre del catálogo (sin distinguir mayúsculas y
    /// quitando `<>` que Discord agrega a los links), luego acepta una URL
    /// http(s) directa.
    pub fn resolve(&self, input: &str) -> Result<ResolvedStream, SessionError> {
        let key = input
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim();

        if key.is_empty() {
            return Err(SessionError::InvalidTarget(input.to_string()));
        }

        if let Some((name, entry)) = self
            .stations
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
        {
            return Ok(ResolvedStream::new(name.clone(), entry.url.clone()));
        }

        if is_stream_url(key) {
            return Ok(ResolvedStream::new(key, key));
        }

        Err(SessionError::InvalidTarget(input.to_string()))
    }

    pub fn stations(&self) -> impl Iterator<Item = (&String, &StationEntry)> {
        self.stations.iter()
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}
