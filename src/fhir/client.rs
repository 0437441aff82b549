//! HTTP client for FHIR R4 REST servers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use tracing::debug;

use super::api::{DownstreamApi, SourceApi, SubscriptionApi};
use super::bundle::Bundle;
use super::error::FhirError;
use super::retry::{RetryConfig, retry_with_backoff};
use super::subscription::{FHIR_JSON, Subscription};
use crate::config::{BasicCredentials, EndpointConfig};
use crate::types::{Resource, ResourceId, ResourceType, format_timestamp};

#[derive(Debug, Clone)]
pub struct FhirClientConfig {
    pub base_url: String,
    pub credentials: Option<BasicCredentials>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl FhirClientConfig {
    pub fn new(endpoint: &EndpointConfig, timeout: Duration, connect_timeout: Duration) -> Self {
        FhirClientConfig {
            base_url: endpoint.base_url.clone(),
            credentials: endpoint.credentials.clone(),
            timeout,
            connect_timeout,
            retry: RetryConfig::DEFAULT,
        }
    }
}

/// A FHIR server reached over HTTP. Used for both the source and the
/// downstream system.
#[derive(Debug, Clone)]
pub struct FhirClient {
    http: Client,
    config: FhirClientConfig,
}

impl FhirClient {
    pub fn new(config: FhirClientConfig) -> Result<Self, FhirError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| FhirError::from_reqwest("building HTTP client", e))?;
        Ok(FhirClient { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(ACCEPT, FHIR_JSON);
        match &self.config.credentials {
            Some(c) => request.basic_auth(&c.username, Some(&c.password)),
            None => request,
        }
    }

    /// Sends a request and maps non-success statuses to errors.
    async fn execute(&self, what: &str, request: RequestBuilder) -> Result<Response, FhirError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| FhirError::from_reqwest(what, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(FhirError::status(status.as_u16(), format!("{what}: {body}")))
    }

    async fn fetch_bundle(&self, what: &str, request: RequestBuilder) -> Result<Bundle, FhirError> {
        let response = self.execute(what, request).await?;
        response
            .json::<Bundle>()
            .await
            .map_err(|e| FhirError::permanent(format!("{what}: malformed Bundle: {e}")))
    }

    /// Runs a search and follows `next` links until the last page.
    ///
    /// `query` applies to the first page only; later pages use the server's
    /// link verbatim.
    async fn search(
        &self,
        what: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<serde_json::Value>, FhirError> {
        let first = self.url(path);
        let mut bundle = retry_with_backoff(self.config.retry, what, || {
            self.fetch_bundle(what, self.http.get(&first).query(query))
        })
        .await?;

        let mut resources = Vec::new();
        let mut previous = first.clone();
        loop {
            let next = bundle.next_link().map(str::to_string);
            resources.extend(bundle.into_resources());

            let Some(next) = next else { break };
            if next == previous {
                break;
            }
            debug!(operation = what, url = %next, "Following next page");
            bundle = retry_with_backoff(self.config.retry, what, || {
                self.fetch_bundle(what, self.http.get(&next))
            })
            .await?;
            previous = next;
        }

        Ok(resources)
    }
}

impl SourceApi for FhirClient {
    async fn modified_since(
        &self,
        resource_type: &ResourceType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Resource>, FhirError> {
        let what = format!("search {resource_type} modified since");
        let query = [("_lastUpdated", format!("ge{}", format_timestamp(&since)))];
        let found = self.search(&what, resource_type.as_str(), &query).await?;
        Ok(found.into_iter().map(Resource::new).collect())
    }
}

impl SubscriptionApi for FhirClient {
    async fn find_subscriptions(
        &self,
        criteria: &str,
        channel_type: &str,
        payload: &str,
    ) -> Result<Vec<Subscription>, FhirError> {
        let query = [
            ("criteria:exact", escape_search_value(criteria)),
            ("type:exact", escape_search_value(channel_type)),
            ("payload:exact", escape_search_value(payload)),
        ];
        let found = self.search("search Subscription", "Subscription", &query).await?;

        found
            .into_iter()
            .filter(|r| r.get("resourceType").and_then(|t| t.as_str()) == Some("Subscription"))
            .map(|r| {
                serde_json::from_value(r).map_err(|e| {
                    FhirError::permanent(format!("search Subscription: malformed Subscription: {e}"))
                })
            })
            .collect()
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), FhirError> {
        let url = self.url("Subscription");
        let body = encode(subscription)?;
        retry_with_backoff(self.config.retry, "create Subscription", || {
            self.execute(
                "create Subscription",
                self.http
                    .post(&url)
                    .header(CONTENT_TYPE, FHIR_JSON)
                    .body(body.clone()),
            )
        })
        .await?;
        Ok(())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), FhirError> {
        let id = subscription
            .id
            .as_deref()
            .ok_or_else(|| FhirError::permanent("update Subscription: missing id"))?;
        let url = self.url(&format!("Subscription/{id}"));
        let body = encode(subscription)?;
        retry_with_backoff(self.config.retry, "update Subscription", || {
            self.execute(
                "update Subscription",
                self.http
                    .put(&url)
                    .header(CONTENT_TYPE, FHIR_JSON)
                    .body(body.clone()),
            )
        })
        .await?;
        Ok(())
    }
}

impl DownstreamApi for FhirClient {
    async fn upsert(
        &self,
        resource_type: &ResourceType,
        id: &ResourceId,
        resource: &Resource,
    ) -> Result<u16, FhirError> {
        let what = format!("upsert {resource_type}/{id}");
        let url = self.url(&format!("{resource_type}/{id}"));
        let body = encode(resource)?;
        let response = retry_with_backoff(self.config.retry, &what, || {
            self.execute(
                &what,
                self.http
                    .put(&url)
                    .header(CONTENT_TYPE, FHIR_JSON)
                    .body(body.clone()),
            )
        })
        .await?;
        Ok(response.status().as_u16())
    }

    async fn delete(&self, resource_type: &ResourceType, id: &ResourceId) -> Result<u16, FhirError> {
        let what = format!("delete {resource_type}/{id}");
        let url = self.url(&format!("{resource_type}/{id}"));
        let result = retry_with_backoff(self.config.retry, &what, || {
            self.execute(&what, self.http.delete(&url))
        })
        .await;

        match result {
            Ok(response) => Ok(response.status().as_u16()),
            // Already gone.
            Err(e) if matches!(e.status, Some(404 | 410)) => Ok(e.status.unwrap_or(404)),
            Err(e) => Err(e),
        }
    }
}

/// Escapes the characters FHIR search treats as separators in a value.
fn escape_search_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ',' | '$' | '|') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, FhirError> {
    serde_json::to_vec(value)
        .map_err(|e| FhirError::permanent(format!("serializing request body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::subscription::{CHANNEL_REST_HOOK, SubscriptionChannel};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, credentials: Option<BasicCredentials>) -> FhirClient {
        FhirClient::new(FhirClientConfig {
            base_url: server.uri(),
            credentials,
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0),
        })
        .unwrap()
    }

    fn patient(id: &str) -> serde_json::Value {
        json!({
            "resourceType": "Patient",
            "id": id,
            "meta": { "lastUpdated": "2024-01-01T00:00:10.000+00:00" }
        })
    }

    #[tokio::test]
    async fn modified_since_follows_next_links() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Patient"))
            .and(query_param("_lastUpdated", "ge2023-12-31T23:59:45.000+00:00"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resourceType": "Bundle",
                "link": [{ "relation": "next", "url": format!("{}/Patient?page=2", server.uri()) }],
                "entry": [{ "resource": patient("1") }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/Patient"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resourceType": "Bundle",
                "entry": [{ "resource": patient("2") }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let since = "2023-12-31T23:59:45Z".parse::<DateTime<Utc>>().unwrap();
        let found = client_for(&server, None)
            .modified_since(&ResourceType::new("Patient"), since)
            .await
            .unwrap();

        let ids: Vec<_> = found.iter().map(|r| r.id().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn upsert_puts_resource_with_basic_auth() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/Patient/1"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .and(header("content-type", FHIR_JSON))
            .and(body_json(patient("1")))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some(BasicCredentials::new("user", "pass")));
        let status = client
            .upsert(
                &ResourceType::new("Patient"),
                &ResourceId::new("1"),
                &Resource::new(patient("1")),
            )
            .await
            .unwrap();
        assert_eq!(status, 201);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/Patient/1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/Patient/1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let status = client_for(&server, None)
            .upsert(
                &ResourceType::new("Patient"),
                &ResourceId::new("1"),
                &Resource::new(patient("1")),
            )
            .await
            .unwrap();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/Patient/1"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid resource"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .upsert(
                &ResourceType::new("Patient"),
                &ResourceId::new("1"),
                &Resource::new(patient("1")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(422));
        assert!(!err.is_retriable());
        assert!(err.message.contains("invalid resource"));
    }

    #[tokio::test]
    async fn delete_of_missing_resource_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/Patient/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let status = client_for(&server, None)
            .delete(&ResourceType::new("Patient"), &ResourceId::new("gone"))
            .await
            .unwrap();
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn find_subscriptions_uses_exact_search_parameters() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Subscription"))
            .and(query_param("criteria:exact", r"[Patient\,ServiceRequest]"))
            .and(query_param("type:exact", CHANNEL_REST_HOOK))
            .and(query_param("payload:exact", FHIR_JSON))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resourceType": "Bundle",
                "entry": [{ "resource": {
                    "resourceType": "Subscription",
                    "id": "sub-1",
                    "status": "active",
                    "criteria": "[Patient,ServiceRequest]",
                    "channel": { "type": "rest-hook", "endpoint": "http://bridge/fhir" }
                }}]
            })))
            .mount(&server)
            .await;

        let found = client_for(&server, None)
            .find_subscriptions("[Patient,ServiceRequest]", CHANNEL_REST_HOOK, FHIR_JSON)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_deref(), Some("sub-1"));
    }

    #[test]
    fn search_values_escape_separators() {
        assert_eq!(escape_search_value("[Patient,ServiceRequest]"), r"[Patient\,ServiceRequest]");
        assert_eq!(escape_search_value(r"a\b|c$d"), r"a\\b\|c\$d");
        assert_eq!(escape_search_value("rest-hook"), "rest-hook");
    }

    #[tokio::test]
    async fn update_subscription_requires_id() {
        let server = MockServer::start().await;
        let sub = Subscription {
            resource_type: "Subscription".to_string(),
            id: None,
            status: "active".to_string(),
            reason: None,
            criteria: "[Patient]".to_string(),
            channel: SubscriptionChannel {
                channel_type: CHANNEL_REST_HOOK.to_string(),
                endpoint: None,
                payload: None,
                header: Vec::new(),
                extra: Default::default(),
            },
            extra: Default::default(),
        };

        let err = client_for(&server, None)
            .update_subscription(&sub)
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
    }
}
