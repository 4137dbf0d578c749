//! Convenience HTTP request handlers that use ureq underneath in order to ensure safe usage
//! when reading the body and reducing boilerplate.

use secrecy::{ExposeSecret, SecretString};
use std::io;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
pub use ureq;
use ureq::Response;
pub use url;
use url::Url;

/// Errors that may arrise during an http request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP status error with the (truncated) body the server replied with.
    #[error("Http {0}: {1}")]
    Http(u16, String),
    /// HTTP Transport error.
    #[error("Transport: {0}")]
    Transport(ureq::Transport),
    /// IO Error
    #[error("IO: {0}")]
    IO(#[from] io::Error),
    /// Parsing or manipulation of Urls.
    #[error("Url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<ureq::Error> for Error {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Status(code, response) => {
                let mut body = String::new();
                // The body is only used for diagnostics, a failed read leaves it empty.
                let _ = response
                    .into_reader()
                    .take(MAX_BYTES_FROM_ERROR_RESPONSE)
                    .read_to_string(&mut body);
                Self::Http(code, body.trim().to_owned())
            }
            ureq::Error::Transport(t) => Self::Transport(t),
        }
    }
}

impl Error {
    /// HTTP status code if the server replied with an error status.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(code, _) => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How to process the response.
pub trait FromResponse {
    /// Result of processing the response.
    type Output;
    /// Process the response from the server.
    ///
    /// This function will only be called if the server did not return an error status.
    ///
    /// # Errors
    /// Should return error if the operation failed.
    fn from_response(response: ureq::Response) -> Result<Self::Output>;
}

/// This response handler reads the body as a string.
pub struct StringResponse {}

impl FromResponse for StringResponse {
    type Output = String;

    fn from_response(response: Response) -> Result<Self::Output> {
        let mut result = String::new();
        response.into_safe_reader().read_to_string(&mut result)?;
        Ok(result)
    }
}

/// HTTP method for the request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Method {
    Post,
}

/// Defines an Http Request.
pub trait Request {
    /// How the response should be handled.
    type Response: FromResponse;

    /// Http Method.
    const METHOD: Method;

    /// The url of the request relative to the client's base url. An empty string targets the
    /// base url itself.
    fn url(&self) -> String;

    /// Build the request.
    ///
    /// Headers and body should be set here.
    ///
    /// # Errors
    /// Returns error if building the operation failed.
    fn build(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        Ok(builder)
    }
}

pub struct RequestBuilder {
    request: ureq::Request,
    body: Option<Vec<u8>>,
}

impl RequestBuilder {
    fn new(request: ureq::Request) -> Self {
        Self {
            request,
            body: None,
        }
    }
    /// Set a header with `key` and `value`.
    #[must_use]
    pub fn header(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.request = self.request.set(key.as_ref(), value.as_ref());
        self
    }

    /// Set bearer authentication `token`.
    #[must_use]
    pub fn bearer_token(self, token: impl AsRef<str>) -> Self {
        self.header("authorization", format!("Bearer {}", token.as_ref()))
    }

    /// Set the body as a collection of bytes.
    #[must_use]
    pub fn bytes(mut self, bytes: Vec<u8>) -> Self {
        self.body = Some(bytes);
        self
    }
}

/// Http client builder.
#[derive(Debug)]
pub struct ClientBuilder {
    base_url: Url,
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: String,
    allow_http: bool,
    bearer_token: Option<SecretString>,
}

impl ClientBuilder {
    fn new(base_url: Url) -> Self {
        Self {
            user_agent: "NoClient/0.1.0".to_string(),
            base_url,
            request_timeout: None,
            connect_timeout: None,
            allow_http: false,
            bearer_token: None,
        }
    }

    /// Set the user agent to be submitted with every request.
    #[must_use]
    pub fn user_agent(mut self, agent: &str) -> Self {
        self.user_agent = agent.to_string();
        self
    }

    /// Set the full request timeout. By default there is no timeout.
    #[must_use]
    pub fn request_timeout(mut self, duration: Duration) -> Self {
        self.request_timeout = Some(duration);
        self
    }

    /// Set the connection timeout. By default there is no timeout.
    #[must_use]
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = Some(duration);
        self
    }

    /// Allow http request
    #[must_use]
    pub fn allow_http(mut self) -> Self {
        self.allow_http = true;
        self
    }

    /// Authenticate every request with the given bearer `token`.
    #[must_use]
    pub fn bearer_token(mut self, token: SecretString) -> Self {
        self.bearer_token = Some(token);
        self
    }

    /// Create the client.
    #[must_use]
    pub fn build(self) -> Arc<Client> {
        let mut builder = ureq::AgentBuilder::new();

        if let Some(d) = self.request_timeout {
            builder = builder.timeout(d);
        }

        if let Some(d) = self.connect_timeout {
            builder = builder.timeout_connect(d);
        }

        if !self.allow_http {
            builder = builder.https_only(true);
        }

        let agent = builder
            .user_agent(&self.user_agent)
            .max_idle_connections(0)
            .max_idle_connections_per_host(0)
            .build();

        Arc::new(Client {
            agent,
            base_url: self.base_url,
            bearer_token: self.bearer_token,
        })
    }
}

/// HTTP Client on which to execute requests.
///
/// All request executed on this client will be resolved against the base url.
pub struct Client {
    agent: ureq::Agent,
    base_url: Url,
    bearer_token: Option<SecretString>,
}

impl Client {
    /// Create a new builder with the given `base_url`.
    #[must_use]
    pub fn builder(base_url: Url) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    /// Execute the request and return the result.
    ///
    /// This is just a thin wrapper around [`ureq::Request`] that sets default headers
    /// and executes the correct function depending on whether the request has a body or not.
    ///
    /// # Errors
    /// Returns an error if the request construction, execution or response handling failed.
    pub fn execute<R: Request>(
        &self,
        request: &R,
    ) -> Result<<R::Response as FromResponse>::Output> {
        let url = self.base_url.join(&request.url())?;
        let ureq_request = match R::METHOD {
            Method::Post => self.agent.post(url.as_str()),
        };

        let mut builder = RequestBuilder::new(ureq_request);

        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_token(token.expose_secret());
        }

        let builder = request.build(builder)?;

        tracing::trace!("{:?} {}", R::METHOD, url);
        let ureq_response = if let Some(body) = builder.body {
            builder.request.send_bytes(body.as_ref())?
        } else {
            builder.request.call()?
        };

        R::Response::from_response(ureq_response)
    }
}

/// Extension trait to read the body with safe upper limit.
trait ExtSafeResponse {
    /// Create a safe reader that reads up to a maximum number of bytes from the server.
    fn into_safe_reader(self) -> impl Read;
}

const MAX_BYTES_FROM_RESPONSE: u64 = 10_000_000;
const MAX_BYTES_FROM_ERROR_RESPONSE: u64 = 4096;

impl ExtSafeResponse for Response {
    fn into_safe_reader(self) -> impl Read {
        self.into_reader().take(MAX_BYTES_FROM_RESPONSE)
    }
}

#[cfg(test)]
struct EchoRequest(&'static str);

#[cfg(test)]
impl Request for EchoRequest {
    type Response = StringResponse;
    const METHOD: Method = Method::Post;

    fn url(&self) -> String {
        String::new()
    }

    fn build(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        Ok(builder
            .header("X-Test", "yes")
            .bytes(self.0.as_bytes().to_vec()))
    }
}

#[test]
fn post_resolves_empty_url_to_base_and_sends_headers() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/topic")
        .match_header("x-test", "yes")
        .match_header("authorization", "Bearer tk_secret")
        .match_body("hello")
        .with_status(200)
        .with_body(r#"{"id":"abc"}"#)
        .create();

    let url = Url::parse(&format!("{}/topic", server.url())).unwrap();
    let client = Client::builder(url)
        .allow_http()
        .bearer_token(SecretString::from("tk_secret".to_owned()))
        .build();

    let echo = client.execute(&EchoRequest("hello")).unwrap();
    assert_eq!(echo, r#"{"id":"abc"}"#);
    mock.assert();
}

#[test]
fn error_status_keeps_body() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("POST", "/topic")
        .with_status(403)
        .with_body(r#"{"error":"forbidden"}"#)
        .create();

    let url = Url::parse(&format!("{}/topic", server.url())).unwrap();
    let client = Client::builder(url).allow_http().build();

    let err = client.execute(&EchoRequest("hello")).unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert!(err.to_string().contains("forbidden"));
}

#[test]
fn https_only_rejects_plain_http() {
    let url = Url::parse("http://127.0.0.1:9/topic").unwrap();
    let client = Client::builder(url).build();
    let err = client.execute(&EchoRequest("hello")).unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}

#[cfg(test)]
struct PlainRequest;

#[cfg(test)]
impl Request for PlainRequest {
    type Response = StringResponse;
    const METHOD: Method = Method::Post;

    fn url(&self) -> String {
        "plain".to_owned()
    }
}

#[test]
fn string_response_accepts_any_body() {
    let mut server = mockito::Server::new();
    let url = Url::parse(&format!("{}/", server.url())).unwrap();
    let client = Client::builder(url).allow_http().build();

    let _ok = server
        .mock("POST", "/plain")
        .with_status(200)
        .with_body("ok")
        .create();
    assert_eq!(client.execute(&PlainRequest).unwrap(), "ok");

    server.reset();
    let _empty = server.mock("POST", "/plain").with_status(204).create();
    assert_eq!(client.execute(&PlainRequest).unwrap(), "");
}
