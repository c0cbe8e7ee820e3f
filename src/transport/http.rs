use reqwest::StatusCode;

use super::*;

/// Web UI transport: fetches `*.live.asp` status pages with basic auth.
///
/// Every request stands alone and carries the credentials. Connection
/// pooling is disabled, so "connected" only means the client is built; the
/// first fetch is what reaches the router.
pub struct HttpTransport {
    target: String,
    base_url: String,
    username: String,
    password: String,
    timeout: Duration,
    client: Option<reqwest::Client>,
    state: ConnectionState,
}

impl HttpTransport {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            target: config.target(),
            base_url: format!("http://{}:{}", config.host, config.port()),
            username: config.username.clone(),
            password: config.password.clone().unwrap_or_default(),
            timeout: config.timeout(),
            client: None,
            state: ConnectionState::Disconnected,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn map_error(&self, path: &str, e: reqwest::Error) -> WrtError {
        if e.is_timeout() {
            WrtError::ExecTimeout(format!("{path} (no response within {:?})", self.timeout))
        } else if e.is_connect() {
            WrtError::ConnectionError(format!("{}: {e}", self.target))
        } else {
            WrtError::HttpError(e)
        }
    }

    async fn fetch(&self, client: &reqwest::Client, path: &str) -> Result<String, WrtError> {
        let response = client
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| self.map_error(path, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(WrtError::AuthenticationFailed(self.target.clone()));
        }
        if !status.is_success() {
            return Err(WrtError::CommandError(format!("GET /{path} returned {status}")));
        }
        response.text().await.map_err(|e| self.map_error(path, e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), WrtError> {
        self.state = ConnectionState::Connecting;
        let built = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .build();
        match built {
            Ok(client) => {
                debug!("{} HTTP client ready", self.target);
                self.client = Some(client);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.client = None;
                self.state = ConnectionState::Failed;
                Err(WrtError::ConnectionError(format!("{}: {e}", self.target)))
            }
        }
    }

    async fn run(&mut self, request: &Request) -> Result<String, WrtError> {
        let Request::Page(page) = request else {
            return Err(unsupported(TransportKind::Http, request));
        };
        if !self.state.is_connected() {
            return Err(WrtError::NotConnected);
        }
        let Some(client) = self.client.clone() else {
            return Err(WrtError::NotConnected);
        };

        debug!("Fetching /{} from {}", page.path, self.target);
        match self.fetch(&client, &page.path).await {
            Ok(body) => {
                trace!("/{} returned {} bytes", page.path, body.len());
                Ok(body)
            }
            Err(e) => {
                self.client = None;
                self.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), WrtError> {
        self.client = None;
        self.state = ConnectionState::Disconnected;
        Ok(())
    }
}
