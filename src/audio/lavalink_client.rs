use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::audio::equalizer::EqBand;
use crate::audio::node::{
    AudioNode, LoadResult, LoadedTrack, NodeError, NodeEvent, PlayRequest, PlayerEvent,
    TrackEndReason,
};
use crate::audio::voice::VoiceConnection;
use crate::nodes::{NodeInfo, NodeRegistry};
use crate::retry::RetryPolicy;

const CLIENT_NAME: &str = concat!("akio/", env!("CARGO_PKG_VERSION"));

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadResponse {
    load_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct PlaylistData {
    info: PlaylistInfo,
    tracks: Vec<LoadedTrack>,
}

#[derive(Debug, Deserialize)]
struct PlaylistInfo {
    name: String,
}

impl LoadResponse {
    fn into_result(self) -> Result<LoadResult, NodeError> {
        let decode = |e: serde_json::Error| NodeError::Decode(e.to_string());
        match self.load_type.as_str() {
            "track" => Ok(LoadResult::Track(
                serde_json::from_value(self.data).map_err(decode)?,
            )),
            "playlist" => {
                let playlist: PlaylistData = serde_json::from_value(self.data).map_err(decode)?;
                Ok(LoadResult::Playlist {
                    name: playlist.info.name,
                    tracks: playlist.tracks,
                })
            }
            "search" => Ok(LoadResult::Search(
                serde_json::from_value(self.data).map_err(decode)?,
            )),
            "error" => Ok(LoadResult::Error(
                self.data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            _ => Ok(LoadResult::Empty),
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    track: Option<UpdateTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filters: Option<Filters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<VoiceConnection>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTrack {
    /// `null` detiene el track actual
    encoded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<Value>,
}

#[derive(Debug, Serialize)]
struct Filters {
    equalizer: Vec<EqBand>,
}

/// Mensajes recibidos por el socket de eventos del nodo
#[derive(Debug, Deserialize)]
#[serde(tag = "op")]
enum IncomingMessage {
    #[serde(rename = "ready")]
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        resumed: bool,
    },
    #[serde(rename = "playerUpdate")]
    PlayerUpdate {
        #[serde(rename = "guildId")]
        guild_id: String,
    },
    #[serde(rename = "stats")]
    Stats {
        #[serde(default)]
        players: u32,
        #[serde(rename = "playingPlayers", default)]
        playing_players: u32,
    },
    #[serde(rename = "event")]
    Event(EventPayload),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload {
    #[serde(rename = "type")]
    kind: String,
    guild_id: String,
    #[serde(default)]
    track: Option<EventTrack>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    exception: Option<EventException>,
    #[serde(default)]
    threshold_ms: Option<u64>,
    #[serde(default)]
    code: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTrack {
    #[serde(default)]
    user_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EventException {
    #[serde(default)]
    message: Option<String>,
}

impl EventPayload {
    fn play_id(&self) -> Option<u64> {
        self.track
            .as_ref()
            .and_then(|t| t.user_data.as_ref())
            .and_then(|data| data.get("playId"))
            .and_then(Value::as_u64)
    }

    fn into_node_event(self, node: &str) -> Option<NodeEvent> {
        let guild_id = self.guild_id.parse().ok()?;
        let play_id = self.play_id();
        let event = match self.kind.as_str() {
            "TrackStartEvent" => PlayerEvent::TrackStart { play_id },
            "TrackEndEvent" => PlayerEvent::TrackEnd {
                play_id,
                reason: TrackEndReason::parse(self.reason.as_deref().unwrap_or("finished")),
            },
            "TrackExceptionEvent" => PlayerEvent::TrackException {
                play_id,
                message: self
                    .exception
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            "TrackStuckEvent" => PlayerEvent::TrackStuck {
                play_id,
                threshold_ms: self.threshold_ms.unwrap_or_default(),
            },
            "WebSocketClosedEvent" => PlayerEvent::VoiceClosed {
                code: self.code.unwrap_or_default(),
                reason: self.reason.unwrap_or_default(),
            },
            _ => return None,
        };

        Some(NodeEvent::Player {
            node: node.to_string(),
            guild_id,
            event,
        })
    }
}

fn http_error(e: reqwest::Error) -> NodeError {
    if e.is_timeout() {
        NodeError::Timeout
    } else {
        NodeError::Http(e)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, NodeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(NodeError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Un servidor Lavalink v4: llamadas REST más la sesión de su socket de eventos
pub struct LavalinkNode {
    info: NodeInfo,
    http: reqwest::Client,
    session_id: RwLock<Option<String>>,
}

impl LavalinkNode {
    pub fn new(info: NodeInfo, http: reqwest::Client) -> Self {
        Self {
            info,
            http,
            session_id: RwLock::new(None),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn take_session(&self) -> Option<String> {
        self.session_id.write().take()
    }

    fn player_url(&self, guild_id: u64) -> Result<String, NodeError> {
        let session = self
            .session_id()
            .ok_or_else(|| NodeError::NoSession(self.info.identifier.clone()))?;
        Ok(format!(
            "{}/v4/sessions/{}/players/{}",
            self.info.base_url(),
            session,
            guild_id
        ))
    }

    async fn update_player(&self, guild_id: u64, body: &UpdatePlayer) -> Result<(), NodeError> {
        let url = self.player_url(guild_id)?;
        let response = self
            .http
            .patch(&url)
            .query(&[("noReplace", "false")])
            .header("Authorization", &self.info.password)
            .json(body)
            .send()
            .await
            .map_err(http_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn connect(&self, user_id: u64) -> Result<WsStream> {
        let mut request = self
            .info
            .websocket_url()
            .into_client_request()
            .context("invalid websocket url")?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&self.info.password).context("invalid node password")?,
        );
        headers.insert("User-Id", HeaderValue::from(user_id));
        headers.insert("Client-Name", HeaderValue::from_static(CLIENT_NAME));

        let (stream, _response) = connect_async(request).await?;
        Ok(stream)
    }

    fn handle_text(
        &self,
        text: &str,
        events: &mpsc::UnboundedSender<NodeEvent>,
        ready: &mut Option<oneshot::Sender<Result<(), String>>>,
    ) {
        let message: IncomingMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("📨 Mensaje no reconocido de {}: {}", self.info.identifier, e);
                return;
            }
        };

        let node = self.info.identifier.clone();
        match message {
            IncomingMessage::Ready {
                session_id,
                resumed,
            } => {
                info!("🔗 Nodo {} listo (sesión {})", node, session_id);
                *self.session_id.write() = Some(session_id);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                let _ = events.send(NodeEvent::Ready { node, resumed });
            }
            IncomingMessage::Event(payload) => {
                if let Some(event) = payload.into_node_event(&node) {
                    let _ = events.send(event);
                }
            }
            IncomingMessage::Stats {
                players,
                playing_players,
            } => {
                trace!("📊 {}: {} players ({} activos)", node, players, playing_players);
            }
            IncomingMessage::PlayerUpdate { guild_id } => {
                trace!("⏱️ {}: update de guild {}", node, guild_id);
            }
            IncomingMessage::Unknown => {}
        }
    }

    async fn pump(
        &self,
        mut stream: WsStream,
        events: &mpsc::UnboundedSender<NodeEvent>,
        ready: &mut Option<oneshot::Sender<Result<(), String>>>,
    ) {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_text(&text, events, ready),
                Ok(Message::Close(frame)) => {
                    info!("🔌 {} cerró el socket: {:?}", self.info.identifier, frame);
                    break;
                }
                // Ping/pong handled by tungstenite; binary skipped.
                Ok(_) => {}
                Err(e) => {
                    warn!("⚠️ Error en el socket de {}: {}", self.info.identifier, e);
                    break;
                }
            }
        }
    }
}

/// Mantiene vivo el socket de eventos del nodo, reconectando con backoff.
///
/// `ready` se resuelve con la primera sesión; si la primera conexión falla la
/// tarea termina.
async fn run_socket(
    node: Arc<LavalinkNode>,
    user_id: u64,
    events: mpsc::UnboundedSender<NodeEvent>,
    reconnect: RetryPolicy,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    let mut attempt = 0u32;
    let id = node.info.identifier.clone();

    loop {
        match node.connect(user_id).await {
            Ok(stream) => {
                node.pump(stream, &events, &mut ready).await;
                if node.take_session().is_some() {
                    attempt = 0;
                    warn!("🔌 Nodo {} desconectado", id);
                    let _ = events.send(NodeEvent::Disconnected { node: id.clone() });
                }
            }
            Err(e) => warn!("❌ No se pudo conectar a {}: {:#}", id, e),
        }

        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(format!("{id} never became ready")));
            return;
        }

        let delay = reconnect.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        debug!("🔁 Reconectando a {} en {:?}", id, delay);
        sleep(delay).await;
    }
}

#[async_trait]
impl AudioNode for LavalinkNode {
    fn identifier(&self) -> String {
        self.info.identifier.clone()
    }

    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, NodeError> {
        let url = format!("{}/v4/loadtracks", self.info.base_url());
        let response = self
            .http
            .get(&url)
            .query(&[("identifier", identifier)])
            .header("Authorization", &self.info.password)
            .send()
            .await
            .map_err(http_error)?;
        let body: LoadResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(http_error)?;
        body.into_result()
    }

    async fn play(&self, guild_id: u64, request: PlayRequest) -> Result<(), NodeError> {
        let body = UpdatePlayer {
            track: Some(UpdateTrack {
                encoded: Some(request.encoded),
                user_data: Some(json!({ "playId": request.play_id })),
            }),
            position: Some(request.position_ms),
            volume: Some(request.volume),
            paused: Some(false),
            filters: Some(Filters {
                equalizer: request.equalizer,
            }),
            voice: request.voice,
        };
        self.update_player(guild_id, &body).await
    }

    async fn stop(&self, guild_id: u64) -> Result<(), NodeError> {
        let body = UpdatePlayer {
            track: Some(UpdateTrack {
                encoded: None,
                user_data: None,
            }),
            ..UpdatePlayer::default()
        };
        self.update_player(guild_id, &body).await
    }

    async fn set_pause(&self, guild_id: u64, paused: bool) -> Result<(), NodeError> {
        let body = UpdatePlayer {
            paused: Some(paused),
            ..UpdatePlayer::default()
        };
        self.update_player(guild_id, &body).await
    }

    async fn set_volume(&self, guild_id: u64, volume: u16) -> Result<(), NodeError> {
        let body = UpdatePlayer {
            volume: Some(volume),
            ..UpdatePlayer::default()
        };
        self.update_player(guild_id, &body).await
    }

    async fn seek(&self, guild_id: u64, position_ms: u64) -> Result<(), NodeError> {
        let body = UpdatePlayer {
            position: Some(position_ms),
            ..UpdatePlayer::default()
        };
        self.update_player(guild_id, &body).await
    }

    async fn set_equalizer(&self, guild_id: u64, bands: Vec<EqBand>) -> Result<(), NodeError> {
        let body = UpdatePlayer {
            filters: Some(Filters { equalizer: bands }),
            ..UpdatePlayer::default()
        };
        self.update_player(guild_id, &body).await
    }

    async fn destroy(&self, guild_id: u64) -> Result<(), NodeError> {
        let url = self.player_url(guild_id)?;
        let response = self
            .http
            .delete(&url)
            .header("Authorization", &self.info.password)
            .send()
            .await
            .map_err(http_error)?;
        match check_status(response).await {
            Ok(_) | Err(NodeError::Status { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct PooledNode {
    node: Arc<LavalinkNode>,
    socket: JoinHandle<()>,
}

/// Registro de nodos Lavalink conectados; los eventos de todos van a un solo canal
pub struct LavalinkPool {
    http: reqwest::Client,
    user_id: u64,
    events: mpsc::UnboundedSender<NodeEvent>,
    nodes: DashMap<String, PooledNode>,
    ready_timeout: Duration,
    reconnect: RetryPolicy,
}

impl LavalinkPool {
    pub fn new(
        user_id: u64,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(CLIENT_NAME)
            .timeout(request_timeout)
            .build()
            .context("cannot build HTTP client")?;

        Ok(Self {
            http,
            user_id,
            events,
            nodes: DashMap::new(),
            ready_timeout: Duration::from_secs(15),
            reconnect: RetryPolicy::new(u32::MAX, Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl NodeRegistry for LavalinkPool {
    async fn register(&self, info: &NodeInfo) -> Result<()> {
        if self.nodes.contains_key(&info.identifier) {
            return Ok(());
        }

        let node = Arc::new(LavalinkNode::new(info.clone(), self.http.clone()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let socket = tokio::spawn(run_socket(
            node.clone(),
            self.user_id,
            self.events.clone(),
            self.reconnect,
            ready_tx,
        ));

        match timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.nodes
                    .insert(info.identifier.clone(), PooledNode { node, socket });
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                socket.abort();
                anyhow::bail!(reason)
            }
            _ => {
                socket.abort();
                anyhow::bail!("{} did not send ready in time", info.identifier)
            }
        }
    }

    async fn unregister(&self, identifier: &str) {
        if let Some((_, pooled)) = self.nodes.remove(identifier) {
            pooled.socket.abort();
            pooled.node.take_session();
            debug!("🗑️ Nodo {} desregistrado", identifier);
        }
    }

    fn node(&self, identifier: &str) -> Option<Arc<dyn AudioNode>> {
        self.nodes
            .get(identifier)
            .map(|pooled| pooled.node.clone() as Arc<dyn AudioNode>)
    }

    fn is_connected(&self, identifier: &str) -> bool {
        self.nodes
            .get(identifier)
            .is_some_and(|pooled| pooled.node.session_id().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::NodeDescriptor;
    use pretty_assertions::assert_eq;

    fn node() -> LavalinkNode {
        let info = NodeInfo::from(NodeDescriptor {
            host: "lava.example".to_string(),
            port: 2333,
            password: None,
            secure: false,
            identifier: Some("main".to_string()),
            version: None,
        });
        LavalinkNode::new(info, reqwest::Client::new())
    }

    #[test]
    fn parses_every_load_type() {
        let search: LoadResponse = serde_json::from_str(
            r#"{"loadType": "search", "data": [{"encoded": "QAAA", "info": {
                "identifier": "dQw4w9WgXcQ", "isSeekable": true, "author": "Rick Astley",
                "length": 212000, "isStream": false, "position": 0,
                "title": "Never Gonna Give You Up", "uri": "https://youtu.be/dQw4w9WgXcQ",
                "sourceName": "youtube"}, "pluginInfo": {}, "userData": {}}]}"#,
        )
        .unwrap();
        match search.into_result().unwrap() {
            LoadResult::Search(tracks) => {
                assert_eq!(tracks.len(), 1);
                assert_eq!(tracks[0].info.author, "Rick Astley");
                assert_eq!(tracks[0].to_track(5).duration, 212_000);
            }
            other => panic!("unexpected {other:?}"),
        }

        let playlist: LoadResponse = serde_json::from_str(
            r#"{"loadType": "playlist", "data": {"info": {"name": "Mix", "selectedTrack": -1},
                "pluginInfo": {}, "tracks": []}}"#,
        )
        .unwrap();
        assert_eq!(
            playlist.into_result().unwrap(),
            LoadResult::Playlist {
                name: "Mix".to_string(),
                tracks: vec![]
            }
        );

        let empty: LoadResponse = serde_json::from_str(r#"{"loadType": "empty", "data": {}}"#).unwrap();
        assert_eq!(empty.into_result().unwrap(), LoadResult::Empty);

        let error: LoadResponse = serde_json::from_str(
            r#"{"loadType": "error", "data": {"message": "blocked", "severity": "common"}}"#,
        )
        .unwrap();
        assert_eq!(error.into_result().unwrap(), LoadResult::Error("blocked".to_string()));
    }

    #[test]
    fn play_body_carries_play_id_and_voice() {
        let body = UpdatePlayer {
            track: Some(UpdateTrack {
                encoded: Some("QAAA".to_string()),
                user_data: Some(json!({ "playId": 7 })),
            }),
            volume: Some(70),
            voice: Some(VoiceConnection {
                token: "t".to_string(),
                endpoint: "e".to_string(),
                session_id: "s".to_string(),
            }),
            ..UpdatePlayer::default()
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["track"]["userData"]["playId"], 7);
        assert_eq!(value["voice"]["sessionId"], "s");
        assert!(value.get("paused").is_none());

        let stop = UpdatePlayer {
            track: Some(UpdateTrack {
                encoded: None,
                user_data: None,
            }),
            ..UpdatePlayer::default()
        };
        assert_eq!(serde_json::to_string(&stop).unwrap(), r#"{"track":{"encoded":null}}"#);
    }

    #[test]
    fn ready_sets_session_and_events_are_forwarded() {
        let node = node();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let mut ready = Some(ready_tx);

        node.handle_text(r#"{"op": "ready", "resumed": false, "sessionId": "abc"}"#, &tx, &mut ready);
        assert_eq!(node.session_id().as_deref(), Some("abc"));
        assert!(ready.is_none());
        assert_eq!(ready_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(
            rx.try_recv().unwrap(),
            NodeEvent::Ready {
                node: "main".to_string(),
                resumed: false
            }
        );

        node.handle_text(
            r#"{"op": "event", "type": "TrackEndEvent", "guildId": "42",
                "track": {"encoded": "QAAA", "info": {}, "userData": {"playId": 9}},
                "reason": "finished"}"#,
            &tx,
            &mut ready,
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            NodeEvent::Player {
                node: "main".to_string(),
                guild_id: 42,
                event: PlayerEvent::TrackEnd {
                    play_id: Some(9),
                    reason: TrackEndReason::Finished
                }
            }
        );

        node.handle_text(r#"{"op": "stats", "players": 3, "playingPlayers": 1}"#, &tx, &mut ready);
        node.handle_text(r#"{"op": "somethingNew"}"#, &tx, &mut ready);
        node.handle_text("not json", &tx, &mut ready);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stuck_and_closed_events_translate() {
        let stuck: EventPayload = serde_json::from_str(
            r#"{"type": "TrackStuckEvent", "guildId": "1", "thresholdMs": 10000,
                "track": {"userData": {"playId": 3}}}"#,
        )
        .unwrap();
        assert_eq!(
            stuck.into_node_event("n"),
            Some(NodeEvent::Player {
                node: "n".to_string(),
                guild_id: 1,
                event: PlayerEvent::TrackStuck {
                    play_id: Some(3),
                    threshold_ms: 10_000
                }
            })
        );

        let closed: EventPayload = serde_json::from_str(
            r#"{"type": "WebSocketClosedEvent", "guildId": "1", "code": 4014, "reason": "Disconnected", "byRemote": true}"#,
        )
        .unwrap();
        assert!(matches!(
            closed.into_node_event("n"),
            Some(NodeEvent::Player {
                event: PlayerEvent::VoiceClosed { code: 4014, .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn calls_without_session_fail_as_transport_errors() {
        let node = node();
        let err = node.stop(1).await.unwrap_err();
        assert!(matches!(err, NodeError::NoSession(_)));
        assert!(err.is_transport());
    }
}
