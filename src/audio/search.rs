use tracing::{debug, info, warn};
use url::Url;

use crate::audio::node::{AudioNode, LoadResult, NodeError};
use crate::retry::RetryPolicy;

/// Convierte búsquedas de usuarios en consultas al nodo, probando cada estrategia en orden.
///
/// Los links se consultan tal cual; el texto libre pasa por los prefijos de
/// búsqueda configurados (`ytmsearch`, `ytsearch`, `scsearch` por defecto)
/// hasta que alguno devuelva algo.
#[derive(Debug, Clone)]
pub struct SearchResolver {
    prefixes: Vec<String>,
    retry: RetryPolicy,
}

pub fn is_url(query: &str) -> bool {
    Url::parse(query.trim())
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

impl SearchResolver {
    pub fn new(prefixes: Vec<String>, retry: RetryPolicy) -> Self {
        Self { prefixes, retry }
    }

    /// Identificadores a probar para `query`, en orden
    pub fn strategies(&self, query: &str) -> Vec<String> {
        let query = query.trim();
        if is_url(query) {
            return vec![query.to_string()];
        }
        self.prefixes
            .iter()
            .map(|prefix| format!("{}:{}", prefix.trim_end_matches(':'), query))
            .collect()
    }

    /// Retorna la primera consulta con resultados.
    ///
    /// `Ok(LoadResult::Empty)` significa que el nodo respondió sin coincidencias.
    /// Solo hay error cuando ninguna estrategia llegó al nodo.
    pub async fn resolve(&self, node: &dyn AudioNode, query: &str) -> Result<LoadResult, NodeError> {
        let mut last_error = None;
        let mut answered = false;

        for identifier in self.strategies(query) {
            debug!("🔍 Buscando '{}' en {}", identifier, node.identifier());
            let attempt = self
                .retry
                .run("búsqueda", || node.load_tracks(&identifier))
                .await;

            match attempt {
                Ok(result) if !result.is_empty() => {
                    info!("✅ Resultado para '{}'", identifier);
                    return Ok(result);
                }
                Ok(LoadResult::Error(message)) => {
                    answered = true;
                    warn!("⚠️ '{}' falló en el nodo: {}", identifier, message);
                }
                Ok(_) => {
                    answered = true;
                    debug!("📭 Sin resultados para '{}'", identifier);
                }
                Err(e) => {
                    warn!("❌ Error buscando '{}': {}", identifier, e);
                    if !e.is_transport() {
                        answered = true;
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(LoadResult::Empty),
        }
    }
}
