// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use gate_types::{QuoteRequest, QuoteResponse, QuoteStatus};
use rocket::{get, http::Status, post, routes, serde::json::Json, Route, State};
use serde::Serialize;
use tracing::error;

use crate::{QuoteError, QuoteSource};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct LogsBody {
    pub logs: Vec<String>,
}

type ApiResult<T> = Result<Json<T>, (Status, Json<ErrorBody>)>;

fn reject(status: Status, error: impl ToString) -> (Status, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

async fn generate(source: &Arc<QuoteSource>, report_data: Vec<u8>) -> ApiResult<QuoteResponse> {
    let source = source.clone();
    let result = tokio::task::spawn_blocking(move || source.quote(Some(&report_data)))
        .await
        .map_err(|e| {
            error!("quote task failed: {e}");
            reject(Status::InternalServerError, "quote generation aborted")
        })?;
    match result {
        Ok(quote) => Ok(Json(quote)),
        Err(err @ QuoteError::InvalidReportData(_)) => Err(reject(Status::BadRequest, err)),
        Err(err @ QuoteError::QuoteUnavailable(_)) => {
            Err(reject(Status::ServiceUnavailable, err))
        }
    }
}

#[get("/status")]
fn status(source: &State<Arc<QuoteSource>>) -> Json<QuoteStatus> {
    Json(source.status())
}

#[get("/quote")]
async fn get_quote(source: &State<Arc<QuoteSource>>) -> ApiResult<QuoteResponse> {
    generate(source, Vec::new()).await
}

#[post("/quote", data = "<request>")]
async fn post_quote(
    source: &State<Arc<QuoteSource>>,
    request: Json<QuoteRequest>,
) -> ApiResult<QuoteResponse> {
    let report_data = match &request.report_data {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| reject(Status::BadRequest, format!("reportData is not base64: {e}")))?,
        None => Vec::new(),
    };
    generate(source, report_data).await
}

#[get("/logs")]
fn logs(source: &State<Arc<QuoteSource>>) -> Json<LogsBody> {
    Json(LogsBody {
        logs: source.log().lines(),
    })
}

pub fn routes() -> Vec<Route> {
    routes![status, get_quote, post_quote, logs]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::FakeBackend;
    use crate::LogRing;
    use gate_types::QuoteMethod;
    use rocket::http::ContentType;
    use rocket::local::asynchronous::Client;

    async fn client(backends: Vec<Box<dyn crate::Backend>>) -> Client {
        let source = Arc::new(QuoteSource::new(backends, Arc::new(LogRing::new(16))));
        let rocket = rocket::build().manage(source).mount("/", routes());
        Client::tracked(rocket).await.unwrap()
    }

    #[tokio::test]
    async fn status_reports_first_available_method() {
        let client = client(vec![Box::new(FakeBackend::new(QuoteMethod::Native, false))]).await;
        let resp = client.get("/status").dispatch().await;
        assert_eq!(resp.status(), Status::Ok);
        let body: serde_json::Value = resp.into_json().await.unwrap();
        assert_eq!(body, serde_json::json!({"available": true, "method": "native"}));
    }

    #[tokio::test]
    async fn post_quote_binds_report_data() {
        let client = client(vec![Box::new(FakeBackend::new(QuoteMethod::Configfs, false))]).await;
        let resp = client
            .post("/quote")
            .header(ContentType::JSON)
            .body(r#"{"reportData":"AQID"}"#)
            .dispatch()
            .await;
        assert_eq!(resp.status(), Status::Ok);
        let body: serde_json::Value = resp.into_json().await.unwrap();
        assert_eq!(body["method"], "configfs");
        assert_eq!(body["measurements"]["mrtd"], "aa".repeat(48));
        let report_data = STANDARD
            .decode(body["report_data"].as_str().unwrap())
            .unwrap();
        assert_eq!(&report_data[..3], &[1, 2, 3]);
        assert_eq!(body["quote_size"], 1226);
    }

    #[tokio::test]
    async fn oversized_or_malformed_report_data_is_400() {
        let client = client(vec![Box::new(FakeBackend::new(QuoteMethod::Configfs, false))]).await;
        let too_long = STANDARD.encode([0u8; 65]);
        let resp = client
            .post("/quote")
            .header(ContentType::JSON)
            .body(format!(r#"{{"reportData":"{too_long}"}}"#))
            .dispatch()
            .await;
        assert_eq!(resp.status(), Status::BadRequest);

        let resp = client
            .post("/quote")
            .header(ContentType::JSON)
            .body(r#"{"reportData":"not base64!"}"#)
            .dispatch()
            .await;
        assert_eq!(resp.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn no_backend_is_503_and_logged() {
        let client = client(vec![Box::new(FakeBackend::new(QuoteMethod::Native, true))]).await;
        let resp = client.get("/quote").dispatch().await;
        assert_eq!(resp.status(), Status::ServiceUnavailable);
        let body: serde_json::Value = resp.into_json().await.unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("quote unavailable"));

        let logs: serde_json::Value = client.get("/logs").dispatch().await.into_json().await.unwrap();
        assert_eq!(logs["logs"].as_array().unwrap().len(), 1);
    }
}
