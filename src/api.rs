//! HTTP control API.
//!
//! Every route lives under `/v1.0/sdnmgmt` and answers JSON. Missing or malformed query
//! parameters give 400.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::Controller;
use crate::error::TopologyError;
use crate::mac::{Dpid, MacAddr};
use crate::orchestrator::ControlPlane;
use crate::telemetry::FlowSnapshot;
use crate::topology::{NodeId, PathCost};

pub const API_PREFIX: &str = "/v1.0/sdnmgmt";

#[derive(Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest(format!("missing parameter {}", name)))
}

fn parse<T>(value: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ApiError::BadRequest(e.to_string()))
}

/// Run `f` on the blocking pool. Handlers that write to switches go through here so that
/// a slow switch or a busy controller lock never holds a runtime worker.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

pub fn router(controller: Arc<Controller>) -> Router {
    let routes = Router::new()
        .route("/query", post(query))
        .route("/view", get(view))
        .route("/placement", get(placement))
        .route("/macs", get(macs))
        .route("/cost", get(cost))
        .route("/discovery", get(discovery))
        .route("/hypervisors", get(hypervisors))
        .route("/remove", post(remove))
        .route("/migrate", post(migrate));
    Router::new().nest(API_PREFIX, routes).with_state(controller)
}

pub async fn serve(listener: tokio::net::TcpListener, controller: Arc<Controller>) -> std::io::Result<()> {
    axum::serve(listener, router(controller)).await
}

/// Number of switches asked for counters.
pub async fn query(State(ctl): State<Arc<Controller>>) -> Result<Json<usize>, ApiError> {
    let asked = blocking(move || Ok(ctl.request_flow_stats())).await?;
    Ok(Json(asked))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Endpoints {
    pub mac1: MacAddr,
    pub mac2: MacAddr,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViewEntry {
    #[serde(flatten)]
    pub snapshot: FlowSnapshot,
    pub endpoints: Endpoints,
}

pub async fn view(State(ctl): State<Arc<Controller>>) -> Json<BTreeMap<String, ViewEntry>> {
    let entries = ctl.with_telemetry(|tele| {
        tele.snapshots()
            .map(|(pair, snapshot)| {
                let entry = ViewEntry {
                    snapshot: *snapshot,
                    endpoints: Endpoints {
                        mac1: pair.mac1(),
                        mac2: pair.mac2(),
                    },
                };
                (pair.to_string(), entry)
            })
            .collect()
    });
    Json(entries)
}

pub async fn placement(State(ctl): State<Arc<Controller>>) -> Json<BTreeMap<MacAddr, Option<Dpid>>> {
    Json(ctl.placement())
}

pub async fn macs(State(ctl): State<Arc<Controller>>) -> Json<BTreeMap<MacAddr, Ipv4Addr>> {
    Json(ctl.with_topology(|topo| topo.mac_to_ip().clone()))
}

pub async fn hypervisors(State(ctl): State<Arc<Controller>>) -> Json<BTreeMap<MacAddr, Dpid>> {
    Json(ctl.hypervisors())
}

#[derive(Debug, Default, Deserialize)]
pub struct CostParams {
    pub src: Option<String>,
    pub dst: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CostReply {
    Path(Option<PathCost>),
    /// Cost to every hypervisor switch, `null` where unreachable.
    Hypervisors(BTreeMap<Dpid, Option<PathCost>>),
}

pub async fn cost(
    State(ctl): State<Arc<Controller>>,
    Query(params): Query<CostParams>,
) -> Result<Json<CostReply>, ApiError> {
    let src: NodeId = parse(required(&params.src, "src")?)?;
    let reply = match params.dst.as_deref() {
        Some(dst) => {
            let dst: NodeId = parse(dst)?;
            CostReply::Path(ctl.path_cost(&src, &dst).ok())
        }
        None => CostReply::Hypervisors(
            ctl.hypervisors()
                .into_values()
                .map(|dpid| (dpid, ctl.path_cost(&src, &NodeId::Switch(dpid)).ok()))
                .collect(),
        ),
    };
    Ok(Json(reply))
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscoveryParams {
    /// Comma separated IPv4 addresses.
    pub dst: Option<String>,
}

/// Probe the listed addresses. Returns them once every probe went out.
pub async fn discovery(
    State(ctl): State<Arc<Controller>>,
    Query(params): Query<DiscoveryParams>,
) -> Result<Json<Vec<Ipv4Addr>>, ApiError> {
    let ips = required(&params.dst, "dst")?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse)
        .collect::<Result<Vec<Ipv4Addr>, ApiError>>()?;
    let ips = blocking(move || {
        for ip in &ips {
            ctl.discover_host(*ip).map_err(|e| match e {
                TopologyError::NoSwitches => ApiError::Unavailable(e.to_string()),
                _ => ApiError::BadRequest(e.to_string()),
            })?;
        }
        Ok(ips)
    })
    .await?;
    debug!("probed {} addresses", ips.len());
    Ok(Json(ips))
}

#[derive(Debug, Default, Deserialize)]
pub struct PairParams {
    pub src: Option<String>,
    pub dst: Option<String>,
}

/// Uninstall the path between two hosts, returning it.
pub async fn remove(
    State(ctl): State<Arc<Controller>>,
    Query(params): Query<PairParams>,
) -> Result<Json<Vec<NodeId>>, ApiError> {
    let src: MacAddr = parse(required(&params.src, "src")?)?;
    let dst: MacAddr = parse(required(&params.dst, "dst")?)?;
    let path = blocking(move || {
        ctl.with_topology(|topo| topo.uninstall_path(src, dst))
            .map_err(|e| ApiError::NotFound(e.to_string()))
    })
    .await?;
    info!("path {} -> {} removed on request", src, dst);
    Ok(Json(path))
}

#[derive(Debug, Default, Deserialize)]
pub struct MigrateParams {
    pub mac: Option<String>,
}

/// Detach a host from the topology, returning the switch it left.
pub async fn migrate(
    State(ctl): State<Arc<Controller>>,
    Query(params): Query<MigrateParams>,
) -> Result<Json<Dpid>, ApiError> {
    let mac: MacAddr = parse(required(&params.mac, "mac")?)?;
    let left = blocking(move || ctl.migrate(mac).map_err(|e| ApiError::NotFound(e.to_string()))).await?;
    Ok(Json(left))
}
