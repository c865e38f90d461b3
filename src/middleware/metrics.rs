use crate::state::{AppState, RequestRecord};
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Feeds request counts, latencies and upload volume into `AppState` for `/metrics`.
///
/// Endpoints are keyed by route pattern; requests that match no route are
/// keyed by their raw path. Upload volume is the declared `Content-Length`,
/// and 413 responses are counted separately as rejected uploads.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let path = req.match_pattern().unwrap_or_else(|| req.uri().path().to_string());
        let endpoint = format!("{} {}", method, path);
        let upload_bytes = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            if let Ok(response) = &result {
                let status = response.status();
                let record = RequestRecord {
                    duration_ms,
                    is_error: status.is_client_error() || status.is_server_error(),
                    upload_bytes,
                    too_large: status == StatusCode::PAYLOAD_TOO_LARGE,
                };

                if let Some(app_state) = response.request().app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, record);
                    if record.is_error {
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::service::tests::StubEngine;
    use actix_web::{test, App, HttpResponse};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_counts_requests_and_errors() {
        let state = web::Data::new(AppState::new(
            AppConfig::default(),
            Arc::new(StubEngine::conversation()),
        ));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/bad", web::get().to(|| async { HttpResponse::BadRequest().finish() })),
        )
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/ok").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/bad").to_request()).await;

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /bad"].error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /ok"].request_count, 1);
    }

    #[actix_web::test]
    async fn test_records_upload_volume_by_route() {
        let state = web::Data::new(AppState::new(
            AppConfig::default(),
            Arc::new(StubEngine::conversation()),
        ));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .wrap(MetricsMiddleware)
                .route("/upload/{name}", web::post().to(|| async { HttpResponse::Ok().finish() }))
                .route("/full", web::post().to(|| async { HttpResponse::PayloadTooLarge().finish() })),
        )
        .await;

        for name in ["a", "b"] {
            let req = test::TestRequest::post()
                .uri(&format!("/upload/{}", name))
                .set_payload(vec![0u8; 300])
                .to_request();
            test::call_service(&app, req).await;
        }
        let req = test::TestRequest::post().uri("/full").set_payload(vec![0u8; 50]).to_request();
        test::call_service(&app, req).await;

        let metrics = state.get_metrics_snapshot();
        let upload = &metrics.endpoint_metrics["POST /upload/{name}"];
        assert_eq!(upload.request_count, 2);
        assert_eq!(upload.upload_bytes, 600);
        assert_eq!(upload.rejected_uploads, 0);
        assert_eq!(metrics.endpoint_metrics["POST /full"].rejected_uploads, 1);
    }
}
