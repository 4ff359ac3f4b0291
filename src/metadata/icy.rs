use anyhow::{Context, Result};
use bytes::BytesMut;
use regex::Regex;
use std::time::Duration;
use tracing::debug;

/// Lo que hay en el buffer leído hasta ahora.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IcyBlock<'a> {
    /// Faltan bytes para llegar al bloque de metadata.
    Incomplete,
    /// El servidor mandó un bloque vacío (longitud 0).
    Empty,
    Metadata(&'a [u8]),
}

/// Separa el primer bloque de metadata ICY del audio.
///
/// El servidor intercala, cada `metaint` bytes de audio, un byte de longitud
/// (en bloques de 16) seguido de la metadata.
pub(crate) fn split_metadata(buf: &[u8], metaint: usize) -> IcyBlock<'_> {
    let Some(&length_byte) = buf.get(metaint) else {
        return IcyBlock::Incomplete;
    };

    let length = length_byte as usize * 16;
    if length == 0 {
        return IcyBlock::Empty;
    }

    let start = metaint + 1;
    match buf.get(start..start + length) {
        Some(block) => IcyBlock::Metadata(block),
        None => IcyBlock::Incomplete,
    }
}

/// Lee `StreamTitle` de streams Shoutcast/Icecast.
pub struct IcyFetcher {
    http: reqwest::Client,
    timeout: Duration,
    title_pattern: Regex,
}

impl IcyFetcher {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http,
            timeout,
            title_pattern: Regex::new(r"StreamTitle='([^;]*)';")
                .context("Regex de StreamTitle inválida")?,
        })
    }

    /// Título actual del stream, o `None` si el servidor no manda metadata.
    pub async fn fetch_title(&self, url: &str) -> Result<Option<String>> {
        tokio::time::timeout(self.timeout, self.read_title(url))
            .await
            .with_context(|| format!("Timeout leyendo metadata de {}", url))?
    }

    async fn read_title(&self, url: &str) -> Result<Option<String>> {
        let mut response = self
            .http
            .get(url)
            .header("Icy-MetaData", "1")
            .send()
            .await?
            .error_for_status()?;

        let metaint = response
            .headers()
            .get("icy-metaint")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|metaint| *metaint > 0);

        let Some(metaint) = metaint else {
            debug!("{} no anuncia icy-metaint", url);
            return Ok(None);
        };

        let mut buf = BytesMut::with_capacity(metaint + 1);
        while let Some(chunk) = response.chunk().await? {
            buf.extend_from_slice(&chunk);
            match split_metadata(&buf, metaint) {
                IcyBlock::Incomplete => continue,
                IcyBlock::Empty => return Ok(None),
                IcyBlock::Metadata(block) => return Ok(self.parse_stream_title(block)),
            }
        }

        Ok(None)
    }

    pub(crate) fn parse_stream_title(&self, block: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(block);
        let text = text.trim_end_matches('\0');

        self.title_pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|title| title.as_str().trim().to_string())
            .filter(|title| !title.is_empty())
    }
}
