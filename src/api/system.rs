//! Service-level endpoints: root, health, global stats and scheduler control.

use axum::Json;
use axum::extract::State;

use super::error::ApiResult;
use super::server::AppState;
use crate::core::db::store;

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Polymarket Sentiment Dashboard API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "markets": "/api/markets",
            "categories": "/api/categories",
            "klines": "/api/klines",
            "whales": "/api/whales",
            "metrics": "/api/metrics/{market_id}",
            "insights": "/api/insights/hot-markets",
            "traders": "/api/traders/{address}",
            "websocket_whales": "ws://host/api/ws/whales",
            "websocket_trades": "ws://host/api/ws/trades",
            "websocket_status": "/api/ws/status",
            "scheduler_status": "/api/scheduler/status",
        },
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let scheduler = match &state.scheduler {
        Some(scheduler) => scheduler.status().await,
        None => serde_json::Value::Null,
    };
    Json(serde_json::json!({
        "status": "ok",
        "scheduler": scheduler,
        "websocket": state.ws.status().await,
    }))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state
        .store
        .call(|conn| {
            let mut stats = serde_json::Map::new();
            for table in ["events", "markets", "trades", "whale_trades"] {
                let count = store::table_count(conn, table).unwrap_or(0);
                stats.insert(format!("{table}_count"), serde_json::json!(count));
            }
            let mut sync_state = serde_json::Map::new();
            let mut stmt = conn.prepare("SELECT key, last_block FROM sync_state")?;
            let cursors: Vec<(String, Option<i64>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            for (key, value) in cursors {
                sync_state.insert(key, serde_json::json!(value));
            }
            stats.insert("sync_state".into(), serde_json::Value::Object(sync_state));
            Ok(serde_json::Value::Object(stats))
        })
        .await?;
    Ok(Json(stats))
}

pub async fn scheduler_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    match &state.scheduler {
        None => Json(serde_json::json!({
            "enabled": false,
            "message": "Scheduler not initialized (started with --no-scheduler)",
        })),
        Some(scheduler) => {
            let mut status = scheduler.status().await;
            if let Some(obj) = status.as_object_mut() {
                obj.insert("enabled".into(), serde_json::json!(true));
            }
            Json(status)
        }
    }
}

pub async fn scheduler_trigger(State(state): State<AppState>) -> Json<serde_json::Value> {
    match &state.scheduler {
        None => Json(serde_json::json!({ "error": "Scheduler not enabled" })),
        Some(scheduler) => {
            let result = scheduler.trigger_sync().await;
            Json(serde_json::json!({
                "message": "Sync triggered",
                "result": result,
            }))
        }
    }
}
