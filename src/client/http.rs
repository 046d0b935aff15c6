//! HTTP client for the run API.

use futures::StreamExt;
use serde_json::{Value, json};
use url::{ParseError, Url};

use super::EnvelopeStream;
use super::error::{ClientError, Result};
use crate::protocol::decode_stream;
use crate::run::RunSnapshot;
use crate::server::ErrorBody;

/// HTTP client for the run API.
///
/// # Example
///
/// ```rust,no_run
/// use hitl_relay::client::Client;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new("http://localhost:8123")?;
///
/// let outcome = client.runs().create("echo", "hello").await?;
/// println!("{}: {:?}", outcome.run_id, outcome.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
}

impl Client {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the server (e.g., "http://localhost:8123")
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            base_url,
            http: reqwest::Client::new(),
        })
    }

    /// Create a new client with a custom reqwest client.
    pub fn with_client(base_url: impl AsRef<str>, http: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self { base_url, http })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Access the Runs API.
    pub fn runs(&self) -> RunsApi<'_> {
        RunsApi { client: self }
    }

    /// Access the Threads API.
    pub fn threads(&self) -> ThreadsApi<'_> {
        ThreadsApi { client: self }
    }

    /// Append percent-encoded `segments` to the base URL's path.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl(ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_json(&self, path: &[&str], body: &Value) -> Result<RunSnapshot> {
        let response = self.http.post(self.url(path)?).json(body).send().await?;
        Self::handle_response(response).await
    }

    async fn post_stream(&self, path: &[&str], body: &Value) -> Result<EnvelopeStream> {
        let response = self
            .http
            .post(self.url(path)?)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(decode_stream(response.bytes_stream()).boxed())
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".into());
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (Some(body.code), body.message),
            Err(_) => (None, text),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

/// Runs API client.
#[derive(Debug)]
pub struct RunsApi<'a> {
    client: &'a Client,
}

impl RunsApi<'_> {
    /// Start a run and wait until it completes, fails or suspends.
    pub async fn create(&self, assistant_id: &str, query: &str) -> Result<RunSnapshot> {
        self.client
            .post_json(&["runs"], &run_body(assistant_id, query, None))
            .await
    }

    /// Start a run on a thread created beforehand.
    pub async fn create_on_thread(
        &self,
        assistant_id: &str,
        query: &str,
        thread_id: &str,
    ) -> Result<RunSnapshot> {
        self.client
            .post_json(&["runs"], &run_body(assistant_id, query, Some(thread_id)))
            .await
    }

    /// Start a run and stream its envelopes.
    pub async fn create_stream(&self, assistant_id: &str, query: &str) -> Result<EnvelopeStream> {
        self.client
            .post_stream(&["runs", "stream"], &run_body(assistant_id, query, None))
            .await
    }

    /// Answer a suspended run and wait.
    pub async fn resume(&self, run_id: &str, answer: &str) -> Result<RunSnapshot> {
        self.client
            .post_json(&["runs", "continue"], &json!({ "run_id": run_id, "answer": answer }))
            .await
    }

    /// Answer a suspended run and stream the next segment.
    pub async fn resume_stream(&self, run_id: &str, answer: &str) -> Result<EnvelopeStream> {
        self.client
            .post_stream(
                &["runs", "continue", "stream"],
                &json!({ "run_id": run_id, "answer": answer }),
            )
            .await
    }

    /// Current state of a run.
    pub async fn get(&self, run_id: &str) -> Result<RunSnapshot> {
        let response = self
            .client
            .http
            .get(self.client.url(&["runs", run_id])?)
            .send()
            .await?;
        Client::handle_response(response).await
    }

    /// Cancel a run.
    pub async fn cancel(&self, run_id: &str) -> Result<RunSnapshot> {
        let response = self
            .client
            .http
            .delete(self.client.url(&["runs", run_id])?)
            .send()
            .await?;
        Client::handle_response(response).await
    }
}

/// Threads API client.
#[derive(Debug)]
pub struct ThreadsApi<'a> {
    client: &'a Client,
}

impl ThreadsApi<'_> {
    /// Create a thread, or return the existing one with the same id.
    pub async fn create(&self, thread_id: Option<&str>, metadata: Value) -> Result<RunSnapshot> {
        self.client
            .post_json(
                &["threads"],
                &json!({ "thread_id": thread_id, "metadata": metadata }),
            )
            .await
    }

    /// Latest state of a thread.
    pub async fn state(&self, thread_id: &str) -> Result<RunSnapshot> {
        let response = self
            .client
            .http
            .get(self.client.url(&["threads", thread_id, "state"])?)
            .send()
            .await?;
        Client::handle_response(response).await
    }
}

fn run_body(assistant_id: &str, query: &str, thread_id: Option<&str>) -> Value {
    json!({
        "assistant_id": assistant_id,
        "input": { "messages": [{ "role": "user", "content": query }] },
        "thread_id": thread_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_onto_the_base() {
        let client = Client::new("http://localhost:8123").unwrap();
        assert_eq!(
            client.url(&["runs", "continue"]).unwrap().as_str(),
            "http://localhost:8123/runs/continue"
        );

        let prefixed = Client::new("http://localhost:8123/relay/").unwrap();
        assert_eq!(
            prefixed.url(&["runs", "r-1"]).unwrap().as_str(),
            "http://localhost:8123/relay/runs/r-1"
        );
    }

    #[test]
    fn ids_are_percent_encoded_as_one_segment() {
        let client = Client::new("http://localhost:8123").unwrap();
        assert_eq!(
            client.url(&["threads", "team a/1?x#y", "state"]).unwrap().as_str(),
            "http://localhost:8123/threads/team%20a%2F1%3Fx%23y/state"
        );
    }

    #[test]
    fn non_hierarchical_base_is_an_error() {
        let client = Client::new("mailto:ops@example.com").unwrap();
        assert!(matches!(
            client.url(&["runs"]),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            Client::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn run_body_uses_the_messages_shape() {
        let body = run_body("echo", "hi", None);
        assert_eq!(body["assistant_id"], "echo");
        assert_eq!(body["input"]["messages"][0]["content"], "hi");
        assert!(body["thread_id"].is_null());
    }

    #[tokio::test]
    async fn unreachable_server_is_an_http_error() {
        let client = Client::new("http://127.0.0.1:1").unwrap();
        let err = client.runs().get("r-1").await.unwrap_err();
        assert!(matches!(err, ClientError::Http(_)));
    }
}
