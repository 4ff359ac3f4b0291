use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::sources::ResolvedStream;

/// Intención de reproducción persistida para un servidor.
///
/// Las claves JSON son las mismas que usaba el `state.json` original, así
/// que un archivo viejo se puede reutilizar tal cual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIntent {
    pub voice_channel_id: u64,
    pub text_channel_id: Option<u64>,
    pub stream_url: String,
    pub stream_name: String,
    pub requester_id: Option<u64>,
}

impl PersistedIntent {
    pub fn new(
        stream: &ResolvedStream,
        voice_channel_id: ChannelId,
        text_channel_id: Option<ChannelId>,
        requester_id: Option<UserId>,
    ) -> Self {
        Self {
            voice_channel_id: voice_channel_id.get(),
            text_channel_id: text_channel_id.map(|id| id.get()),
            stream_url: stream.url.clone(),
            stream_name: stream.name.clone(),
            requester_id: requester_id.map(|id| id.get()),
        }
    }

    pub fn voice_channel(&self) -> ChannelId {
        ChannelId::new(self.voice_channel_id)
    }

    pub fn text_channel(&self) -> Option<ChannelId> {
        self.text_channel_id.filter(|id| *id != 0).map(ChannelId::new)
    }

    pub fn requester(&self) -> Option<UserId> {
        self.requester_id.filter(|id| *id != 0).map(UserId::new)
    }

    pub fn stream(&self) -> ResolvedStream {
        ResolvedStream {
            name: self.stream_name.clone(),
            url: self.stream_url.clone(),
        }
    }
}

/// Forma tolerante de una entrada: cualquier campo puede faltar.
#[derive(Debug, Deserialize)]
struct RawIntent {
    voice_channel_id: Option<u64>,
    text_channel_id: Option<u64>,
    stream_url: Option<String>,
    stream_name: Option<String>,
    requester_id: Option<u64>,
}

impl RawIntent {
    fn validate(self) -> Result<PersistedIntent, &'static str> {
        let voice_channel_id = self
            .voice_channel_id
            .filter(|id| *id != 0)
            .ok_or("falta voice_channel_id")?;
        let stream_url = self
            .stream_url
            .filter(|url| !url.trim().is_empty())
            .ok_or("falta stream_url")?;
        let stream_name = self
            .stream_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| stream_url.clone());

        Ok(PersistedIntent {
            voice_channel_id,
            text_channel_id: self.text_channel_id,
            stream_url,
            stream_name,
            requester_id: self.requester_id,
        })
    }
}

struct StoreInner {
    entries: BTreeMap<u64, PersistedIntent>,
    /// El archivo ya se leyó: antes de eso el mapa no representa el disco.
    loaded: bool,
    /// La última escritura falló: el disco está atrasado respecto a memoria.
    dirty: bool,
}

/// Almacén durable de intenciones por servidor (un único archivo JSON).
///
/// Todas las escrituras pasan por el mismo mutex, y cada una reemplaza el
/// archivo completo de forma atómica (temporal + rename), así que un lector
/// nunca ve un registro a medio escribir. El archivo se lee la primera vez
/// que alguien lo usa, sea `load` o `save`.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!("📁 Estado persistente en: {}", path.display());
        Self {
            path,
            inner: Mutex::new(StoreInner {
                entries: BTreeMap::new(),
                loaded: false,
                dirty: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Intenciones guardadas.
    ///
    /// Nunca falla: un archivo ausente, vacío o corrupto produce un mapa
    /// vacío. Las entradas individuales inválidas se descartan y el archivo
    /// se reescribe sin ellas.
    pub async fn load(&self) -> HashMap<GuildId, PersistedIntent> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;

        inner
            .entries
            .iter()
            .map(|(id, intent)| (GuildId::new(*id), intent.clone()))
            .collect()
    }

    async fn ensure_loaded(&self, inner: &mut StoreInner) {
        if inner.loaded {
            return;
        }
        inner.loaded = true;
        inner.entries.clear();

        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📂 {} no existe, iniciando sin estado", self.path.display());
                return;
            }
            Err(e) => {
                warn!("⚠️ No se pudo leer {}: {}. Iniciando sin estado", self.path.display(), e);
                return;
            }
        };

        if content.trim().is_empty() {
            info!("📂 {} está vacío, iniciando sin estado", self.path.display());
            return;
        }

        let raw: HashMap<String, serde_json::Value> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(source) => {
                let err = StorageError::Corrupt {
                    path: self.path.clone(),
                    source,
                };
                warn!("⚠️ {}. Iniciando sin estado", err);
                self.quarantine().await;
                return;
            }
        };

        let mut skipped = 0usize;
        for (key, value) in raw {
            let guild_id = match key.parse::<u64>() {
                Ok(id) if id != 0 => id,
                _ => {
                    warn!("⚠️ Clave de guild inválida en estado: {:?}", key);
                    skipped += 1;
                    continue;
                }
            };

            let intent = serde_json::from_value::<RawIntent>(value)
                .map_err(|_| "formato inválido")
                .and_then(RawIntent::validate);

            match intent {
                Ok(intent) => {
                    info!(
                        "[{}] Estado cargado: VC {} → {}",
                        guild_id, intent.voice_channel_id, intent.stream_name
                    );
                    inner.entries.insert(guild_id, intent);
                }
                Err(reason) => {
                    warn!("[{}] Entrada de estado descartada: {}", guild_id, reason);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            if let Err(e) = self.write_entries(&inner.entries).await {
                error!("Error purgando entradas inválidas: {}", e);
                inner.dirty = true;
            }
        }

        info!("📂 Estado cargado para {} servidor(es)", inner.entries.len());
    }

    /// Guarda (`Some`) o borra (`None`) la intención de un servidor.
    ///
    /// Si la escritura falla el mapa en memoria ya quedó actualizado y se
    /// volverá a escribir completo en la próxima llamada.
    pub async fn save(
        &self,
        guild_id: GuildId,
        intent: Option<&PersistedIntent>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;
        let key = guild_id.get();

        let changed = match intent {
            Some(intent) => inner.entries.insert(key, intent.clone()).as_ref() != Some(intent),
            None => inner.entries.remove(&key).is_some(),
        };

        if !changed && !inner.dirty {
            debug!("[{}] Estado sin cambios, no se escribe", guild_id);
            return Ok(());
        }

        match self.write_entries(&inner.entries).await {
            Ok(()) => {
                inner.dirty = false;
                debug!(
                    "[{}] 💾 Estado guardado ({} servidor(es))",
                    guild_id,
                    inner.entries.len()
                );
                Ok(())
            }
            Err(e) => {
                inner.dirty = true;
                Err(e)
            }
        }
    }

    /// Intención actualmente conocida (vista en memoria del almacén).
    pub async fn get(&self, guild_id: GuildId) -> Option<PersistedIntent> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;
        inner.entries.get(&guild_id.get()).cloned()
    }

    pub async fn len(&self) -> usize {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;
        inner.entries.len()
    }

    async fn write_entries(
        &self,
        entries: &BTreeMap<u64, PersistedIntent>,
    ) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(entries)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    async fn quarantine(&self) {
        let mut target = self.path.clone().into_os_string();
        target.push(".corrupt");
        match fs::rename(&self.path, &target).await {
            Ok(()) => warn!("🗑️ Estado corrupto movido a {:?}", target),
            Err(e) => error!("Error apartando estado corrupto: {}", e),
        }
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StorageError> {
    let wrap = |source: std::io::Error| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(wrap)?;
    tmp.write_all(body).map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;
    tmp.persist(path).map_err(|e| wrap(e.error))?;

    Ok(())
}
