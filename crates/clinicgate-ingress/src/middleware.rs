//! Tenant middleware

use crate::error::IngressError;
use crate::resolver::TenantResolver;
use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use clinicgate_core::cookie::{Cookie, TENANT_SLUG_COOKIE};
use std::sync::Arc;
use tracing::debug;

/// Resolve the tenant for every request.
///
/// - Redirect: answer `307` with `Location` and the tenant cookie
/// - Inactive tenant: rewrite the request to the not-found path, no cookie
/// - Otherwise: insert the `TenantContext` extension and set the tenant cookie
///
/// The resolved slug is also appended to the request's own `Cookie` header,
/// so handlers reading cookies see this request's tenant rather than the
/// previous one.
///
/// Install with `axum::middleware::from_fn_with_state(resolver, tenant_middleware)`
/// on a router that routes nothing itself and falls back to the application
/// router. `Router::layer` runs after routing, and the not-found rewrite has
/// to happen before it.
pub async fn tenant_middleware(
    State(resolver): State<Arc<TenantResolver>>,
    mut req: Request,
    next: Next,
) -> Response {
    let resolution = match resolver.resolve(req.uri(), req.headers()).await {
        Ok(resolution) => resolution,
        Err(e) => {
            tracing::error!("Tenant resolution failed: {}", e);
            return e.into_response();
        }
    };

    if resolution.not_found {
        let not_found_path = resolver.config().not_found_path.as_str();
        let uri = match not_found_path.parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                return IngressError::InvalidConfig(format!(
                    "not-found path '{}': {}",
                    not_found_path, e
                ))
                .into_response();
            }
        };
        debug!(from = %req.uri(), to = %uri, "Rewriting request for inactive tenant");
        *req.uri_mut() = uri;
        req.extensions_mut().insert(resolution.context);
        return next.run(req).await;
    }

    let cookie = match cookie_header(&resolver.tenant_cookie(resolution.slug())) {
        Ok(value) => value,
        Err(e) => return e.into_response(),
    };

    if let Some(location) = resolution.redirect_to {
        let location = match HeaderValue::from_str(&location) {
            Ok(value) => value,
            Err(e) => {
                return IngressError::InvalidRedirect(format!("'{}': {}", location, e))
                    .into_response();
            }
        };
        debug!(location = ?location, "Redirecting to normalized URL");
        return (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, location), (header::SET_COOKIE, cookie)],
        )
            .into_response();
    }

    if let Ok(value) =
        HeaderValue::from_str(&format!("{}={}", TENANT_SLUG_COOKIE, resolution.slug()))
    {
        req.headers_mut().append(header::COOKIE, value);
    }
    req.extensions_mut().insert(resolution.context);
    let mut response = next.run(req).await;
    response.headers_mut().append(header::SET_COOKIE, cookie);
    response
}

fn cookie_header(cookie: &Cookie) -> Result<HeaderValue, IngressError> {
    HeaderValue::from_str(&cookie.to_header_value())
        .map_err(|e| IngressError::Internal(format!("cookie '{}': {}", cookie.name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locale::LocaleConfig;
    use crate::resolver::TenantConfig;
    use async_trait::async_trait;
    use axum::{
        Extension, Router,
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
    };
    use clinicgate_core::tenant::{
        InMemoryTenantDirectory, TenantContext, TenantDirectory, TenantRecord, TenantSlug,
        TenantStatus,
    };
    use tower::ServiceExt;

    async fn page_handler(Extension(tenant): Extension<TenantContext>) -> String {
        format!("{}:{}", tenant.slug(), tenant.resolved_from())
    }

    async fn cookie_handler(headers: axum::http::HeaderMap) -> String {
        use clinicgate_core::cookie::{CookieStore, RequestCookieStore};
        RequestCookieStore::from_headers(&headers)
            .get(TENANT_SLUG_COOKIE)
            .unwrap_or_default()
    }

    async fn not_found_handler() -> (StatusCode, &'static str) {
        (StatusCode::NOT_FOUND, "clinic not found")
    }

    fn app_with(directory: Arc<dyn TenantDirectory>) -> Router {
        let resolver = Arc::new(
            TenantResolver::new(
                TenantConfig {
                    base_domain: "example.com".to_string(),
                    default_slug: "main".to_string(),
                    ..Default::default()
                },
                LocaleConfig::default(),
                directory,
            )
            .unwrap(),
        );

        let routes = Router::new()
            .route("/en/doctors", get(page_handler))
            .route("/api/ping", get(page_handler))
            .route("/api/cookie", get(cookie_handler))
            .route("/not-found", get(not_found_handler));

        Router::new()
            .fallback_service(routes)
            .layer(middleware::from_fn_with_state(resolver, tenant_middleware))
    }

    fn app() -> Router {
        let directory = InMemoryTenantDirectory::from_records([TenantRecord {
            slug: TenantSlug::parse("closed-clinic").unwrap(),
            status: TenantStatus::Inactive,
            custom_domain: Some("closed-clinic.com".to_string()),
        }]);
        app_with(Arc::new(directory))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_resolved_request_gets_context_and_cookie() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/en/doctors")
                    .header("host", "clinic-a.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("tenantSlug=clinic-a"));
        assert_eq!(body_string(response).await, "clinic-a:subdomain");
    }

    #[tokio::test]
    async fn test_override_redirects_with_cookie() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/en/doctors?tenant=clinic-b&page=2")
                    .header("host", "example.com")
                    .header("cookie", "tenantSlug=clinic-a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/en/doctors?page=2"
        );
        assert!(set_cookies(&response)[0].starts_with("tenantSlug=clinic-b"));
    }

    #[tokio::test]
    async fn test_locale_redirect_carries_cookie() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/doctors")
                    .header("host", "example.com")
                    .header("cookie", "tenantSlug=clinic-a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/en/doctors");
        assert!(set_cookies(&response)[0].starts_with("tenantSlug=clinic-a"));
    }

    #[tokio::test]
    async fn test_inactive_tenant_is_rewritten_to_not_found() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/en/doctors")
                    .header("host", "closed-clinic.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(header::LOCATION).is_none());
        assert!(set_cookies(&response).is_empty());
        assert_eq!(body_string(response).await, "clinic not found");
    }

    #[tokio::test]
    async fn test_exempt_path_is_served_directly() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/ping")
                    .header("host", "example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "main:default");
    }

    #[tokio::test]
    async fn test_handler_sees_resolved_tenant_cookie() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/cookie")
                    .header("host", "clinic-a.example.com")
                    .header("cookie", "tenantSlug=clinic-old")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(body_string(response).await, "clinic-a");
    }

    struct FailingDirectory;

    #[async_trait]
    impl TenantDirectory for FailingDirectory {
        async fn find_by_domain(
            &self,
            _domain: &str,
        ) -> clinicgate_core::Result<Option<TenantRecord>> {
            Err(clinicgate_core::Error::Internal("directory offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_directory_failure_is_service_unavailable() {
        let response = app_with(Arc::new(FailingDirectory))
            .oneshot(
                Request::builder()
                    .uri("/en/doctors")
                    .header("host", "some-clinic.org")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
