use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use songbird::Songbird;
use std::sync::Arc;
use tracing::debug;

/// Credenciales del servidor de voz que el nodo necesita para transmitir
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConnection {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

impl From<songbird::ConnectionInfo> for VoiceConnection {
    fn from(info: songbird::ConnectionInfo) -> Self {
        Self {
            token: info.token,
            endpoint: info.endpoint,
            session_id: info.session_id,
        }
    }
}

/// Sale de los canales de voz en nombre del motor
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn leave(&self, guild_id: u64) -> Result<()>;
}

/// Songbird solo hace el handshake del gateway; el audio lo envía el nodo
pub struct SongbirdGateway {
    manager: Arc<Songbird>,
}

impl SongbirdGateway {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn leave(&self, guild_id: u64) -> Result<()> {
        let guild_id = GuildId::new(guild_id);
        if self.manager.get(guild_id).is_some() {
            self.manager.remove(guild_id).await?;
            debug!("👋 Salida de voz en guild {}", guild_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn credentials_use_lavalink_field_names() {
        let voice = VoiceConnection {
            token: "tok".to_string(),
            endpoint: "eu.discord.media".to_string(),
            session_id: "abc".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&voice).unwrap(),
            serde_json::json!({"token": "tok", "endpoint": "eu.discord.media", "sessionId": "abc"})
        );
    }

    #[tokio::test]
    async fn leaving_a_guild_without_a_call_is_a_no_op() {
        let gateway = SongbirdGateway::new(Songbird::serenity());
        assert!(gateway.leave(42).await.is_ok());
    }
}
