use std::path::PathBuf;

use super::*;

enum SshAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

/// SSH transport: one session, one exec channel per command.
///
/// Because each command gets its own channel, a command abandoned by the
/// caller or cut off by the timeout does not poison the session; the
/// transport stays `Connected` as long as the SSH connection itself is open.
pub struct SshTransport {
    target: String,
    host: String,
    port: u16,
    username: String,
    auth: SshAuth,
    security: SecurityLevel,
    check_host_key: bool,
    timeout: Duration,
    client: Option<Client>,
    state: ConnectionState,
}

impl SshTransport {
    pub fn new(config: &RouterConfig) -> Self {
        let auth = match &config.key_file {
            Some(path) => SshAuth::KeyFile {
                path: path.clone(),
                passphrase: config.key_passphrase.clone(),
            },
            None => SshAuth::Password(config.password.clone().unwrap_or_default()),
        };
        Self {
            target: config.target(),
            host: config.host.clone(),
            port: config.port(),
            username: config.username.clone(),
            auth,
            security: config.security,
            check_host_key: config.check_host_key,
            timeout: config.timeout(),
            client: None,
            state: ConnectionState::Disconnected,
        }
    }

    fn auth_method(&self) -> AuthMethod {
        match &self.auth {
            SshAuth::Password(password) => AuthMethod::with_password(password),
            SshAuth::KeyFile { path, passphrase } => {
                AuthMethod::with_key_file(path, passphrase.as_deref())
            }
        }
    }

    fn fail(&mut self) {
        self.state = ConnectionState::Failed;
        self.client = None;
    }
}

/// How one exec ended.
enum Exec {
    TimedOut,
    Broken(String),
    Exited {
        status: u32,
        stdout: String,
        stderr: String,
    },
}

/// Maps an exec onto the caller's result, and says whether the session
/// survives it.
///
/// A timeout only costs the session when the connection itself went down;
/// the command ran on its own channel. A non-zero exit of a command that
/// does not tolerate failure drops the session.
fn settle(
    command: &str,
    tolerate_failure: bool,
    exec: Exec,
    session_closed: bool,
    timeout: Duration,
) -> (Result<String, WrtError>, bool) {
    match exec {
        Exec::TimedOut => (
            Err(WrtError::ExecTimeout(format!(
                "{command} (no output within {timeout:?})"
            ))),
            !session_closed,
        ),
        Exec::Broken(e) => (Err(WrtError::CommandError(format!("{command}: {e}"))), false),
        Exec::Exited { status, stdout, .. } if status == 0 || tolerate_failure => {
            (Ok(stdout), !session_closed)
        }
        Exec::Exited { status, stderr, .. } => (
            Err(WrtError::CommandError(format!(
                "{command} exited with status {status}: {}",
                stderr.trim()
            ))),
            false,
        ),
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn state(&self) -> ConnectionState {
        match (&self.client, self.state) {
            (Some(client), ConnectionState::Connected) if client.is_closed() => {
                ConnectionState::Failed
            }
            (_, state) => state,
        }
    }

    async fn connect(&mut self) -> Result<(), WrtError> {
        if let Some(old) = self.client.take() {
            let _ = old.disconnect().await;
        }
        self.state = ConnectionState::Connecting;

        let config = Config {
            preferred: preferred(self.security),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let server_check = if self.check_host_key {
            ServerCheckMethod::DefaultKnownHostsFile
        } else {
            ServerCheckMethod::NoCheck
        };

        let connecting = Client::connect_with_config(
            (self.host.clone(), self.port),
            &self.username,
            self.auth_method(),
            server_check,
            config,
        );
        match tokio::time::timeout(self.timeout, connecting).await {
            Ok(Ok(client)) => {
                debug!("{} SSH session established", self.target);
                self.client = Some(client);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                debug!("{} SSH connect failed: {}", self.target, e);
                self.fail();
                Err(WrtError::Ssh2Error(e))
            }
            Err(_) => {
                self.fail();
                Err(WrtError::ConnectionError(format!(
                    "{} did not complete the SSH handshake within {:?}",
                    self.target, self.timeout
                )))
            }
        }
    }

    async fn run(&mut self, request: &Request) -> Result<String, WrtError> {
        let Request::Shell(ShellCommand {
            command,
            tolerate_failure,
        }) = request
        else {
            return Err(unsupported(TransportKind::Ssh, request));
        };
        if !self.state().is_connected() {
            return Err(WrtError::NotConnected);
        }
        let Some(client) = self.client.as_ref() else {
            return Err(WrtError::NotConnected);
        };

        debug!("Running {:?} at {}", command, self.target);
        let exec = match tokio::time::timeout(self.timeout, client.execute(command)).await {
            Err(_) => Exec::TimedOut,
            Ok(Err(e)) => Exec::Broken(e.to_string()),
            Ok(Ok(result)) => {
                trace!("{:?} returned {:?}", command, result.stdout);
                Exec::Exited {
                    status: result.exit_status,
                    stdout: result.stdout,
                    stderr: result.stderr,
                }
            }
        };
        let session_closed = client.is_closed();

        let (result, keep_session) =
            settle(command, *tolerate_failure, exec, session_closed, self.timeout);
        if !keep_session {
            self.fail();
        }
        result
    }

    async fn disconnect(&mut self) -> Result<(), WrtError> {
        if let Some(client) = self.client.take() {
            debug!("Closing SSH session to {}", self.target);
            if let Err(e) = client.disconnect().await {
                debug!("Error closing SSH session to {}: {}", self.target, e);
            }
        }
        self.state = ConnectionState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RouterConfig {
        RouterConfig::new("192.0.2.1", TransportKind::Ssh).with_credentials("root", "pw")
    }

    #[tokio::test]
    async fn run_before_connect_is_rejected() {
        let mut transport = SshTransport::new(&config());
        let err = transport.run(&Request::shell("arp -n")).await.unwrap_err();
        assert!(matches!(err, WrtError::NotConnected));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn page_requests_are_unsupported() {
        let mut transport = SshTransport::new(&config());
        let err = transport
            .run(&Request::page("Status_Lan.live.asp"))
            .await
            .unwrap_err();
        assert!(matches!(err, WrtError::UnsupportedRequest { .. }));
    }

    fn exited(status: u32, stdout: &str, stderr: &str) -> Exec {
        Exec::Exited {
            status,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(9);

    #[test]
    fn timeout_keeps_an_open_session() {
        let (result, keep) = settle("ip neigh", false, Exec::TimedOut, false, TIMEOUT);
        assert!(matches!(result, Err(WrtError::ExecTimeout(_))));
        assert!(keep);

        let (result, keep) = settle("ip neigh", false, Exec::TimedOut, true, TIMEOUT);
        assert!(matches!(result, Err(WrtError::ExecTimeout(_))));
        assert!(!keep);
    }

    #[test]
    fn non_zero_exit_drops_the_session() {
        let exec = exited(1, "", "cat: can't open '/tmp/dnsmasq.leases'\n");
        let (result, keep) = settle("cat /tmp/dnsmasq.leases", false, exec, false, TIMEOUT);
        let err = result.unwrap_err();
        assert!(matches!(err, WrtError::CommandError(ref msg) if msg.contains("status 1")));
        assert_eq!(err.kind(), crate::error::ErrorKind::Command);
        assert!(!keep);
    }

    #[test]
    fn tolerant_command_returns_output_on_failure() {
        let exec = exited(127, "-sh: wl: not found\n", "");
        let (result, keep) = settle("wl ver", true, exec, false, TIMEOUT);
        assert_eq!(result.unwrap(), "-sh: wl: not found\n");
        assert!(keep);
    }

    #[test]
    fn broken_channel_drops_the_session() {
        let exec = Exec::Broken("channel closed".to_string());
        let (result, keep) = settle("arp -n", true, exec, false, TIMEOUT);
        assert!(matches!(result, Err(WrtError::CommandError(_))));
        assert!(!keep);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut transport = SshTransport::new(&config());
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
