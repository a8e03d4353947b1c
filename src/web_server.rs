/*!
Point d'accès HTTP d'état

Expose en JSON :
- `/api/status` : dernier tableau d'état publié par la boucle principale
- `/api/time` : temps courant de la base de temps disciplinée
*/

use crate::gps_state::{DeviceState, SharedDeviceState};
use crate::status::{StatusBoard, StatusSnapshot};
use crate::timebase::Timebase;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// État partagé du serveur web
#[derive(Clone)]
pub struct WebServerState {
    board: StatusBoard,
    timebase: Arc<Timebase>,
    device_state: Arc<SharedDeviceState>,
}

/// Réponse de `/api/time`
#[derive(Debug, Clone, Serialize)]
pub struct TimeResponse {
    /// Temps disponible (au moins un fix GPS reçu)
    pub have_time: bool,
    pub synced: bool,
    pub state: DeviceState,

    /// Secondes depuis epoch Unix
    pub unix_seconds: Option<u64>,

    /// Microsecondes dans la seconde
    pub micros: Option<u32>,

    /// Timestamp NTP complet (64 bits)
    pub ntp_timestamp: Option<u64>,

    /// Parties secondes et fraction du timestamp NTP
    pub ntp_seconds: Option<u32>,
    pub ntp_fraction: Option<u32>,

    /// Date ISO 8601
    pub utc: Option<String>,
}

pub struct WebServer {
    bind_addr: String,
    state: WebServerState,
}

impl WebServer {
    pub fn new(
        bind_addr: String,
        board: StatusBoard,
        timebase: Arc<Timebase>,
        device_state: Arc<SharedDeviceState>,
    ) -> Self {
        WebServer {
            bind_addr,
            state: WebServerState {
                board,
                timebase,
                device_state,
            },
        }
    }

    /// Démarre le serveur web dans un thread Tokio séparé
    pub fn start(self) -> std::thread::JoinHandle<()> {
        info!("Starting web server on {}", self.bind_addr);

        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Failed to create web server runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                if let Err(e) = self.run().await {
                    error!("Web server error: {:#}", e);
                }
            });
        })
    }

    async fn run(self) -> anyhow::Result<()> {
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!("Web server listening on {}", self.bind_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

fn router(state: WebServerState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/time", get(time_handler))
        .with_state(state)
}

/// API REST : tableau d'état complet
async fn status_handler(State(state): State<WebServerState>) -> Json<StatusSnapshot> {
    Json(state.board.get())
}

/// API REST : temps actuel
async fn time_handler(State(state): State<WebServerState>) -> Json<TimeResponse> {
    Json(current_time(&state.timebase, &state.device_state))
}

fn current_time(timebase: &Timebase, device_state: &SharedDeviceState) -> TimeResponse {
    let status = timebase.status();
    let now = timebase.now_unix();
    let ntp = timebase.now_ntp();

    TimeResponse {
        have_time: status.have_time,
        synced: status.synced,
        state: device_state.load(),
        unix_seconds: now.map(|t| t.seconds),
        micros: now.map(|t| t.micros),
        ntp_timestamp: ntp.map(|ts| ts.0),
        ntp_seconds: ntp.map(|ts| ts.seconds()),
        ntp_fraction: ntp.map(|ts| ts.fraction()),
        utc: timebase.now_utc().map(|utc| utc.to_rfc3339()),
    }
}
