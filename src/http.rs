//! HTTP API
//!
//! JSON in, JSON out, camelCase fields. Every route except `/health`,
//! `/{role}/register` and `/{role}/authenticate` needs
//! `Authorization: Bearer <token>`, and the role in the path must be the
//! caller's verified role.
//!
//! ## Patient
//! - `POST /patient/health-data` - Submit a record (returns the one-time key)
//! - `GET  /patient/health-records` - Own records with active consent
//! - `GET  /patient/health-records/{id}` - One own record
//! - `POST /patient/health-records/{id}/decrypt` - Decrypt with `{encryptionKey}`
//! - `PUT  /patient/consent/{recordId}` - Supersede consent
//! - `GET  /patient/consent/{recordId}` - Active consent
//! - `GET  /patient/consent/{recordId}/history` - All consent versions
//! - `GET  /patient/access-requests` - Requests for own records
//! - `POST /patient/access-requests/{id}/respond` - `{approved}`
//!
//! ## Researcher
//! - `GET  /researcher/datasets/search?dataType&ageGroup&gender&region`
//! - `POST /researcher/datasets/request-access`
//! - `GET  /researcher/access-requests`
//! - `GET  /researcher/approved-datasets`
//! - `GET  /researcher/datasets/{id}/access`
//!
//! ## Either role
//! - `GET  /{role}/token-transactions`, `GET /{role}/token-balance`
//! - `GET  /{role}/notifications?unreadOnly=true`
//! - `PUT  /{role}/notifications/{id}/read`
//!
//! ```bash
//! curl -X POST localhost:8095/patient/register -d '{"walletKey":"0xabc"}'
//! TOKEN=$(curl -s -X POST localhost:8095/patient/authenticate -d '{"walletKey":"0xabc"}' | jq -r .token)
//! curl -X POST -H "Authorization: Bearer $TOKEN" localhost:8095/patient/health-data \
//!      -d '{"dataType":"bloodwork","data":{"hba1c":5.4}}'
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::collaborators::identity::bearer_token;
use crate::collaborators::VerifiedPrincipal;
use crate::db::principals::Role;
use crate::db::records::SearchFilters;
use crate::error::HealthError;
use crate::services::access_service::{CreateAccessRequest, RespondInput};
use crate::services::consent_service::UpdateConsent;
use crate::services::identity_service::{AuthenticateInput, RegisterInput};
use crate::services::record_service::SubmitHealthData;
use crate::services::response::{self, error_response, from_create_result, from_result};
use crate::services::Services;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

type HttpResponse = Response<Full<Bytes>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptInput {
    encryption_key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationQuery {
    #[serde(default)]
    unread_only: bool,
}

pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
    production: bool,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            bind_addr,
            production: false,
        }
    }

    /// Hide 5xx detail from clients
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), HealthError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Result<HttpResponse, hyper::Error> {
        Ok(self.handle(req).await)
    }

    /// Route one request; errors become JSON error bodies
    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        debug!(method = %parts.method, path = %parts.uri.path(), "Incoming request");

        match self.route(&parts, body).await {
            Ok(resp) => resp,
            Err(e) => error_response(e, self.production),
        }
    }

    async fn route<B>(&self, parts: &Parts, body: B) -> Result<HttpResponse, HealthError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let s = &self.services;
        let production = self.production;
        let path = parts.uri.path().to_string();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let resp = match (&parts.method, segments.as_slice()) {
            (&Method::GET, ["health"]) => self.health()?,

            // Identity
            (&Method::POST, [role, "register"]) => {
                let role = path_role(role)?;
                let input: RegisterInput = read_json(body).await?;
                from_create_result(s.identity.register(role, input), production)
            }
            (&Method::POST, [role, "authenticate"]) => {
                let role = path_role(role)?;
                let input: AuthenticateInput = read_json(body).await?;
                from_result(s.identity.authenticate(role, input), production)
            }

            // Patient records
            (&Method::POST, ["patient", "health-data"]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                let input: SubmitHealthData = read_json(body).await?;
                from_create_result(s.records.submit(&caller.id, input).await, production)
            }
            (&Method::GET, ["patient", "health-records"]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                from_result(s.records.list(&caller.id), production)
            }
            (&Method::GET, ["patient", "health-records", id]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                from_result(s.records.get(id, &caller.id), production)
            }
            (&Method::POST, ["patient", "health-records", id, "decrypt"]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                let input: DecryptInput = read_json(body).await?;
                let data = s.records.decrypt(id, &caller.id, &input.encryption_key).await;
                from_result(data.map(|data| serde_json::json!({ "recordId": id, "data": data })), production)
            }

            // Consent
            (&Method::PUT, ["patient", "consent", record_id]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                let input: UpdateConsent = read_json(body).await?;
                from_result(s.consent.update(record_id, &caller.id, input).await, production)
            }
            (&Method::GET, ["patient", "consent", record_id]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                from_result(s.consent.get_active(record_id, &caller.id), production)
            }
            (&Method::GET, ["patient", "consent", record_id, "history"]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                from_result(s.consent.history(record_id, &caller.id), production)
            }

            // Access requests, owner side
            (&Method::GET, ["patient", "access-requests"]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                from_result(s.access.list_by_owner(&caller.id), production)
            }
            (&Method::POST, ["patient", "access-requests", id, "respond"]) => {
                let caller = self.caller(parts, Role::Patient).await?;
                let input: RespondInput = read_json(body).await?;
                from_result(s.access.respond(id, &caller.id, input.approved).await, production)
            }

            // Researcher
            (&Method::GET, ["researcher", "datasets", "search"]) => {
                self.caller(parts, Role::Researcher).await?;
                let filters: SearchFilters = read_query(parts)?;
                from_result(s.records.search(&filters), production)
            }
            (&Method::POST, ["researcher", "datasets", "request-access"]) => {
                let caller = self.caller(parts, Role::Researcher).await?;
                let input: CreateAccessRequest = read_json(body).await?;
                from_create_result(s.access.create(&caller.id, input), production)
            }
            (&Method::GET, ["researcher", "access-requests"]) => {
                let caller = self.caller(parts, Role::Researcher).await?;
                from_result(s.access.list_by_requester(&caller.id), production)
            }
            (&Method::GET, ["researcher", "approved-datasets"]) => {
                let caller = self.caller(parts, Role::Researcher).await?;
                from_result(s.access.granted_to(&caller.id), production)
            }
            (&Method::GET, ["researcher", "datasets", id, "access"]) => {
                let caller = self.caller(parts, Role::Researcher).await?;
                from_result(s.access.dataset_access(&caller.id, id).await, production)
            }

            // Either role
            (&Method::GET, [role, "token-transactions"]) => {
                let caller = self.caller(parts, path_role(role)?).await?;
                from_result(s.tokens.transactions(&caller.id), production)
            }
            (&Method::GET, [role, "token-balance"]) => {
                let caller = self.caller(parts, path_role(role)?).await?;
                from_result(s.tokens.balance(&caller.id), production)
            }
            (&Method::GET, [role, "notifications"]) => {
                let caller = self.caller(parts, path_role(role)?).await?;
                let query: NotificationQuery = read_query(parts)?;
                from_result(s.notifications.inbox(&caller.id, query.unread_only), production)
            }
            (&Method::PUT, [role, "notifications", id, "read"]) => {
                let caller = self.caller(parts, path_role(role)?).await?;
                from_result(
                    s.notifications
                        .mark_read(id, &caller.id)
                        .map(|()| serde_json::json!({ "id": id, "isRead": true })),
                    production,
                )
            }

            _ => response::not_found("Route not found"),
        };

        Ok(resp)
    }

    /// Verify the bearer token and that the caller holds `role`
    async fn caller(&self, parts: &Parts, role: Role) -> Result<VerifiedPrincipal, HealthError> {
        let header = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let token = bearer_token(header)
            .ok_or_else(|| HealthError::Auth("missing bearer token".into()))?;

        let principal = self.services.verifier.verify(token).await?;
        if principal.role != role {
            return Err(HealthError::Forbidden(format!(
                "{} routes are not available to a {}",
                role, principal.role
            )));
        }
        Ok(principal)
    }

    fn health(&self) -> Result<HttpResponse, HealthError> {
        let stats = self.services.db.stats()?;
        Ok(response::ok(&serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "stats": stats,
        })))
    }
}

fn path_role(segment: &str) -> Result<Role, HealthError> {
    segment
        .parse::<Role>()
        .map_err(|_| HealthError::NotFound(format!("route /{}", segment)))
}

async fn read_json<T, B>(body: B) -> Result<T, HealthError>
where
    T: DeserializeOwned,
    B: Body + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| HealthError::Validation(format!("Failed to read body: {}", e)))?
        .to_bytes();

    Ok(serde_json::from_slice(&bytes)?)
}

fn read_query<T: DeserializeOwned>(parts: &Parts) -> Result<T, HealthError> {
    serde_urlencoded::from_str(parts.uri.query().unwrap_or(""))
        .map_err(|e| HealthError::Validation(format!("Invalid query: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::JwtIdentity;
    use crate::db::HealthDb;
    use crate::services::{Collaborators, Rewards};
    use hyper::StatusCode;

    fn server() -> HttpServer {
        let db = Arc::new(HealthDb::open_in_memory().unwrap());
        let services = Services::new(db, Collaborators::in_memory(JwtIdentity::new_dev()), Rewards::default());
        HttpServer::new(Arc::new(services), "127.0.0.1:0".parse().unwrap())
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn json(resp: HttpResponse) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(server: &HttpServer, role: &str, wallet: &str) -> String {
        let body = format!(r#"{{"walletKey":"{}"}}"#, wallet);
        let resp = server.handle(request(Method::POST, &format!("/{}/register", role), None, &body)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let resp = server.handle(request(Method::POST, &format!("/{}/authenticate", role), None, &body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        json(resp).await["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let server = server();
        let resp = server.handle(request(Method::GET, "/health", None, "")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_auth_and_role_checks() {
        let server = server();
        let patient = login(&server, "patient", "0xpatient").await;

        let missing = server.handle(request(Method::GET, "/patient/health-records", None, "")).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let bogus = server
            .handle(request(Method::GET, "/patient/health-records", Some("garbage"), ""))
            .await;
        assert_eq!(bogus.status(), StatusCode::UNAUTHORIZED);

        let wrong_role = server
            .handle(request(Method::GET, "/researcher/access-requests", Some(&patient), ""))
            .await;
        assert_eq!(wrong_role.status(), StatusCode::FORBIDDEN);

        let ok = server
            .handle(request(Method::GET, "/patient/health-records", Some(&patient), ""))
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_search_and_request_over_http() {
        let server = server();
        let patient = login(&server, "patient", "0xpatient").await;
        let researcher = login(&server, "researcher", "0xlab").await;

        let resp = server
            .handle(request(
                Method::POST,
                "/patient/health-data",
                Some(&patient),
                r#"{"dataType":"bloodwork","data":{"hba1c":5.4},"ageGroup":"30-39"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let receipt = json(resp).await;
        let record_id = receipt["record"]["id"].as_str().unwrap().to_string();
        assert!(receipt["encryptionKey"].as_str().is_some());

        let resp = server
            .handle(request(
                Method::GET,
                "/researcher/datasets/search?dataType=bloodwork&ageGroup=30-39",
                Some(&researcher),
                "",
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let listings = json(resp).await;
        assert_eq!(listings.as_array().unwrap().len(), 1);
        assert!(listings[0]["ownerId"].is_null());

        let body = format!(r#"{{"datasetId":"{}","purpose":"diabetes cohort","duration":30}}"#, record_id);
        let resp = server
            .handle(request(Method::POST, "/researcher/datasets/request-access", Some(&researcher), &body))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = server
            .handle(request(Method::GET, "/patient/notifications?unreadOnly=true", Some(&patient), ""))
            .await;
        let inbox = json(resp).await;
        assert_eq!(inbox["unreadCount"], 1);
        assert_eq!(inbox["notifications"][0]["kind"], "access_request");

        let resp = server
            .handle(request(Method::GET, "/patient/token-balance", Some(&patient), ""))
            .await;
        assert_eq!(json(resp).await["balance"], 10);
    }

    #[tokio::test]
    async fn test_client_errors() {
        let server = server();
        let patient = login(&server, "patient", "0xpatient").await;

        let bad_json = server
            .handle(request(Method::POST, "/patient/health-data", Some(&patient), "{not json"))
            .await;
        assert_eq!(bad_json.status(), StatusCode::BAD_REQUEST);

        let unknown = server
            .handle(request(Method::GET, "/patient/health-records/nope", Some(&patient), ""))
            .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let duplicate = server
            .handle(request(Method::POST, "/patient/register", None, r#"{"walletKey":"0xpatient"}"#))
            .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let no_route = server.handle(request(Method::GET, "/admin/everything", None, "")).await;
        assert_eq!(no_route.status(), StatusCode::NOT_FOUND);
    }
}
