/// Request/response surface over the coordinator.
///
/// Every operation is a JSON-friendly [`Request`] tagged by `op`; every
/// outcome is a [`Response`] that is either `{"status": "ok", ...}` or
/// `{"status": "error", "code", "message"}`. Failures never escape as
/// panics or transport errors, so a host (CLI, socket server, test) only
/// needs to forward bytes.
///
/// The service counts in-flight requests. [`Service::shutdown`] refuses new
/// requests, waits for the running ones to finish and then stops the
/// coordinator.
use crate::coordinator::Coordinator;
use crate::error::{OlapError, OlapResult};
use crate::model::{Granularity, Model};
use crate::query::AggregateRequest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// An operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    CreateCube {
        name: String,
        model: Model,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        principal_entity: Option<String>,
        #[serde(default)]
        skip_build: bool,
    },
    LoadCubes,
    ListCubes,
    DeleteCube {
        name: String,
    },
    RebuildCube {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    StartAutoUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_ms: Option<u64>,
    },
    StopAutoUpdate,
    StartBuffering,
    StopBuffering,
    UpdateAggregates,
    Aggregate {
        cube: String,
        #[serde(flatten)]
        request: AggregateRequest,
    },
}

impl Request {
    /// The `op` tag, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Request::CreateCube { .. } => "createCube",
            Request::LoadCubes => "loadCubes",
            Request::ListCubes => "listCubes",
            Request::DeleteCube { .. } => "deleteCube",
            Request::RebuildCube { .. } => "rebuildCube",
            Request::StartAutoUpdate { .. } => "startAutoUpdate",
            Request::StopAutoUpdate => "stopAutoUpdate",
            Request::StartBuffering => "startBuffering",
            Request::StopBuffering => "stopBuffering",
            Request::UpdateAggregates => "updateAggregates",
            Request::Aggregate { .. } => "aggregate",
        }
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok {
        #[serde(flatten)]
        body: Map<String, JsonValue>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    pub fn ok(body: Map<String, JsonValue>) -> Self {
        Response::Ok { body }
    }

    pub fn error(error: &OlapError) -> Self {
        Response::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// A payload field of a successful response.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        match self {
            Response::Ok { body } => body.get(key),
            Response::Error { .. } => None,
        }
    }

    /// The error code of a failed response.
    pub fn code(&self) -> Option<&str> {
        match self {
            Response::Ok { .. } => None,
            Response::Error { code, .. } => Some(code),
        }
    }
}

/// The request handler.
pub struct Service {
    coordinator: Coordinator,
    /// Requests being served; shutdown waits for this to reach zero.
    in_flight: watch::Sender<usize>,
    closing: AtomicBool,
}

struct InFlight<'a>(&'a Service);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.send_modify(|n| *n -= 1);
    }
}

fn body(key: &str, value: impl Serialize) -> OlapResult<Map<String, JsonValue>> {
    let mut map = Map::new();
    map.insert(key.to_string(), serde_json::to_value(value)?);
    Ok(map)
}

impl Service {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            in_flight: watch::channel(0).0,
            closing: AtomicBool::new(false),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Requests currently being served.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Serve one request.
    pub async fn handle(&self, request: Request) -> Response {
        let op = request.op();
        match self.dispatch(request).await {
            Ok(body) => {
                debug!(op, "request served");
                Response::ok(body)
            }
            Err(e) => {
                warn!(op, code = e.code(), error = %e, "request failed");
                Response::error(&e)
            }
        }
    }

    /// Serve one request given as JSON text.
    pub async fn handle_json(&self, raw: &str) -> Response {
        match decode_json::<Request>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::error(&e),
        }
    }

    fn enter(&self) -> OlapResult<InFlight<'_>> {
        self.in_flight.send_modify(|n| *n += 1);
        let guard = InFlight(self);
        if self.closing.load(Ordering::SeqCst) {
            return Err(OlapError::ShuttingDown);
        }
        Ok(guard)
    }

    async fn dispatch(&self, request: Request) -> OlapResult<Map<String, JsonValue>> {
        let _guard = self.enter()?;
        let coordinator = &self.coordinator;

        match request {
            Request::CreateCube {
                name,
                model,
                principal_entity,
                skip_build,
            } => {
                let metadata = coordinator
                    .create_cube(&name, model, principal_entity, skip_build)
                    .await?;
                body("cube", metadata)
            }
            Request::LoadCubes => body("loaded", coordinator.load_cubes().await?),
            Request::ListCubes => body("cubes", coordinator.list_cubes().await?),
            Request::DeleteCube { name } => {
                coordinator.delete_cube(&name).await?;
                body("deleted", name)
            }
            Request::RebuildCube { name } => body("cube", coordinator.rebuild_cube(&name).await?),
            Request::StartAutoUpdate { interval_ms } => {
                coordinator
                    .start_auto_update(interval_ms.map(Duration::from_millis))
                    .await?;
                body("intervalMs", coordinator.update_interval().as_millis() as u64)
            }
            Request::StopAutoUpdate => {
                coordinator.stop_auto_update().await?;
                Ok(Map::new())
            }
            Request::StartBuffering => {
                coordinator.start_buffering().await?;
                Ok(Map::new())
            }
            Request::StopBuffering => {
                coordinator.stop_buffering().await?;
                Ok(Map::new())
            }
            Request::UpdateAggregates => body("report", coordinator.update_aggregates().await?),
            Request::Aggregate { cube, request } => {
                body("rows", coordinator.aggregate(&cube, request).await?)
            }
        }
    }

    /// Refuse new requests, drain the running ones, stop the coordinator.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(in_flight = self.in_flight(), "service draining");

        // The sender lives as long as `self`, so waiting cannot fail.
        let _ = self.in_flight.subscribe().wait_for(|n| *n == 0).await;

        self.coordinator.shutdown().await;
        info!("service stopped");
    }
}

/// Decode a JSON payload (a request, a model) into `T`.
///
/// An unknown `granularity` token anywhere in the payload is reported as
/// [`OlapError::UnsupportedGranularity`]; any other mismatch is a
/// validation error.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> OlapResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        serde_json::from_str::<JsonValue>(raw)
            .ok()
            .as_ref()
            .and_then(unknown_granularity)
            .unwrap_or_else(|| OlapError::validation(format!("malformed payload: {}", e)))
    })
}

fn unknown_granularity(value: &JsonValue) -> Option<OlapError> {
    match value {
        JsonValue::Object(map) => map.iter().find_map(|(key, v)| match (key.as_str(), v) {
            ("granularity", JsonValue::String(token)) => token.parse::<Granularity>().err(),
            _ => unknown_granularity(v),
        }),
        JsonValue::Array(items) => items.iter().find_map(unknown_granularity),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OlapConfig;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn create_test_service() -> Service {
        let store = Arc::new(MemoryStore::new());
        let feed = store.change_log();
        Service::new(Coordinator::new(store, feed, OlapConfig::default()))
    }

    #[test]
    fn test_request_wire_format() {
        let request: Request = serde_json::from_value(json!({
            "op": "aggregate",
            "cube": "main",
            "dimensions": ["city", {"id": "ts", "granularity": "day"}],
            "measures": ["males"],
            "timeFormat": "iso"
        }))
        .unwrap();

        match request {
            Request::Aggregate { cube, request } => {
                assert_eq!(cube, "main");
                assert_eq!(request.dimensions.len(), 2);
                assert_eq!(request.measures, vec!["males".to_string()]);
            }
            other => panic!("unexpected request {:?}", other),
        }

        let request: Request = serde_json::from_value(json!({"op": "startAutoUpdate", "intervalMs": 50})).unwrap();
        assert_eq!(
            request,
            Request::StartAutoUpdate {
                interval_ms: Some(50)
            }
        );
    }

    #[test]
    fn test_response_wire_format() {
        let error = Response::error(&OlapError::CubeNotFound {
            name: "x".to_string(),
        });
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "cube_not_found");

        let ok = Response::ok(body("deleted", "x").unwrap());
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value, json!({"status": "ok", "deleted": "x"}));
        assert_eq!(serde_json::from_value::<Response>(value).unwrap(), ok);
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let service = create_test_service();
        let response = service.handle_json(r#"{"op": "explode"}"#).await;
        assert_eq!(response.code(), Some("validation"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let service = create_test_service();
        assert!(service.handle(Request::ListCubes).await.is_ok());

        service.shutdown().await;
        let response = service.handle(Request::ListCubes).await;
        assert_eq!(response.code(), Some("shutting_down"));
        assert_eq!(service.in_flight(), 0);
    }
}
