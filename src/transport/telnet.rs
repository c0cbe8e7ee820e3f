use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::*;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// Terminal escape sequences some busybox shells put around the prompt.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b[()][A-Za-z0-9]").expect("valid escape regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum IacState {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Strips telnet commands from the byte stream.
///
/// State carries across reads, so a command split between two TCP segments
/// is still recognized. Every option the server offers or asks for is
/// refused.
#[derive(Debug, Default)]
struct IacFilter {
    state: IacState,
}

impl IacFilter {
    /// Returns `(data, replies)` for one chunk read from the socket.
    fn feed(&mut self, bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(bytes.len());
        let mut replies = Vec::new();
        for &byte in bytes {
            self.state = match (self.state, byte) {
                (IacState::Data, IAC) => IacState::Iac,
                (IacState::Data, 0) => IacState::Data,
                (IacState::Data, b) => {
                    data.push(b);
                    IacState::Data
                }
                (IacState::Iac, IAC) => {
                    data.push(IAC);
                    IacState::Data
                }
                (IacState::Iac, cmd @ WILL..=DONT) => IacState::Negotiate(cmd),
                (IacState::Iac, SB) => IacState::Sub,
                (IacState::Iac, _) => IacState::Data,
                (IacState::Negotiate(cmd), option) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    IacState::Data
                }
                (IacState::Sub, IAC) => IacState::SubIac,
                (IacState::Sub, _) => IacState::Sub,
                (IacState::SubIac, SE) => IacState::Data,
                (IacState::SubIac, _) => IacState::Sub,
            };
        }
        (data, replies)
    }
}

/// The unterminated last line of `text`: where prompts appear.
fn trailing_line(text: &str) -> &str {
    text.rsplit('\n').next().unwrap_or("").trim_end_matches('\r')
}

fn clean(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").replace('\r', "")
}

fn is_shell_prompt(line: &str) -> bool {
    let line = line.trim_end();
    !line.is_empty() && (line.ends_with('#') || line.ends_with('$'))
}

fn is_login_prompt(line: &str) -> bool {
    let line = line.trim_end().to_ascii_lowercase();
    line.ends_with("login:") || line.ends_with("username:")
}

fn is_password_prompt(line: &str) -> bool {
    line.trim_end().to_ascii_lowercase().ends_with("password:")
}

/// Prefix of the line that reports a command's exit status.
const EXIT_MARKER: &str = "@@rc=";

static EXIT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@@rc=(\d+)$").expect("valid exit marker regex"));

/// The line sent for `command`: the command, then an echo of its status.
fn command_line(command: &str) -> String {
    format!("{command}; echo \"{EXIT_MARKER}$?\"")
}

/// Cuts one command's output out of everything read up to the next prompt.
///
/// The first line is the shell's echo of `sent` and is dropped when it
/// matches; the trailing line is the prompt. The exit marker line is taken
/// out of the output and returned as the status.
fn frame_output(raw: &str, sent: &str) -> (String, Option<i32>) {
    let text = clean(raw);
    let body = match text.rfind('\n') {
        Some(pos) => &text[..pos + 1],
        None => "",
    };
    let body = match body.split_once('\n') {
        Some((first, rest)) if first.trim_end().ends_with(sent.trim()) => rest,
        _ => body,
    };

    let mut status = None;
    let mut output = String::with_capacity(body.len());
    for line in body.split_inclusive('\n') {
        if let Some(caps) = EXIT_LINE.captures(line.trim_end()) {
            status = caps[1].parse().ok();
        } else {
            output.push_str(line);
        }
    }
    (output, status)
}

/// Telnet transport: one interactive shell framed by its prompt.
///
/// The stream has no per-command channel, so output left unread by a
/// timeout or a dropped future would be attributed to the next command.
/// Either case leaves the transport `Failed`, and so does a login that
/// never finished.
///
/// Each command is followed by an echo of `$?`, which is how a non-zero
/// exit becomes a [`WrtError::CommandError`].
pub struct TelnetTransport {
    target: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    filter: IacFilter,
    prompt: String,
    state: ConnectionState,
    /// Set while a connect or command owns the stream.
    in_flight: bool,
}

impl TelnetTransport {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            target: config.target(),
            host: config.host.clone(),
            port: config.port(),
            username: config.username.clone(),
            password: config.password.clone().unwrap_or_default(),
            timeout: config.timeout(),
            stream: None,
            filter: IacFilter::default(),
            prompt: String::new(),
            state: ConnectionState::Disconnected,
            in_flight: false,
        }
    }

    fn fail(&mut self) {
        self.state = ConnectionState::Failed;
        self.stream = None;
        self.in_flight = false;
    }

    async fn send_line(&mut self, line: &str) -> Result<(), WrtError> {
        let stream = self.stream.as_mut().ok_or(WrtError::NotConnected)?;
        stream.write_all(format!("{line}\r\n").as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads until `done` accepts the accumulated text.
    async fn read_until(&mut self, done: impl Fn(&str) -> bool) -> Result<String, WrtError> {
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            {
                let text = String::from_utf8_lossy(&received);
                if done(&text) {
                    return Ok(text.into_owned());
                }
            }
            let stream = self.stream.as_mut().ok_or(WrtError::NotConnected)?;
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(WrtError::ChannelDisconnectError);
            }
            let (data, replies) = self.filter.feed(&buf[..n]);
            if !replies.is_empty() {
                stream.write_all(&replies).await?;
            }
            trace!("{} <- {:?}", self.target, String::from_utf8_lossy(&data));
            received.extend_from_slice(&data);
        }
    }

    async fn login(&mut self) -> Result<String, WrtError> {
        let greeting = self
            .read_until(|text| {
                let line = trailing_line(text);
                is_login_prompt(line) || is_password_prompt(line) || is_shell_prompt(line)
            })
            .await?;
        let mut last = trailing_line(&greeting).to_string();

        if is_login_prompt(&last) {
            let username = self.username.clone();
            self.send_line(&username).await?;
            let reply = self
                .read_until(|text| {
                    let line = trailing_line(text);
                    is_password_prompt(line) || is_shell_prompt(line)
                })
                .await?;
            last = trailing_line(&reply).to_string();
        }

        if is_password_prompt(&last) {
            let password = self.password.clone();
            self.send_line(&password).await?;
            let reply = self
                .read_until(|text| {
                    let line = trailing_line(text);
                    is_shell_prompt(line)
                        || is_login_prompt(line)
                        || text.to_ascii_lowercase().contains("incorrect")
                })
                .await?;
            let line = trailing_line(&reply);
            if !is_shell_prompt(line) {
                return Err(WrtError::AuthenticationFailed(self.target.clone()));
            }
            last = line.to_string();
        }

        Ok(clean(&last).trim_end().to_string())
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Telnet
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn state(&self) -> ConnectionState {
        if self.in_flight {
            ConnectionState::Failed
        } else {
            self.state
        }
    }

    async fn connect(&mut self) -> Result<(), WrtError> {
        self.stream = None;
        self.filter = IacFilter::default();
        self.state = ConnectionState::Connecting;
        self.in_flight = true;
        let timeout = self.timeout;

        let addr = (self.host.clone(), self.port);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail();
                return Err(WrtError::ConnectionError(format!("{}: {e}", self.target)));
            }
            Err(_) => {
                self.fail();
                return Err(WrtError::ConnectionError(format!(
                    "{} did not accept a TCP connection within {:?}",
                    self.target, timeout
                )));
            }
        };
        debug!("{} TCP connection successful", self.target);
        self.stream = Some(stream);

        match tokio::time::timeout(timeout, self.login()).await {
            Ok(Ok(prompt)) => {
                debug!("{} logged in, prompt {:?}", self.target, prompt);
                self.prompt = prompt;
                self.state = ConnectionState::Connected;
                self.in_flight = false;
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail();
                Err(match e {
                    WrtError::AuthenticationFailed(_) => e,
                    other => WrtError::ConnectionError(format!("{} login: {other}", self.target)),
                })
            }
            Err(_) => {
                self.fail();
                Err(WrtError::ConnectionError(format!(
                    "{} gave no shell prompt within {:?}",
                    self.target, timeout
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
            return Err(unsupported(TransportKind::Telnet, request));
        };
        if !self.state().is_connected() {
            return Err(WrtError::NotConnected);
        }

        debug!("Running {:?} at {}", command, self.target);
        self.in_flight = true;
        let timeout = self.timeout;
        let prompt = self.prompt.clone();
        let line = command_line(command);
        let exchange = async {
            self.send_line(&line).await?;
            self.read_until(|text| clean(trailing_line(text)).trim_end() == prompt)
                .await
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.fail();
                return Err(WrtError::CommandError(format!("{command}: {e}")));
            }
            Err(_) => {
                self.fail();
                return Err(WrtError::ExecTimeout(format!(
                    "{command} (no prompt within {timeout:?})"
                )));
            }
        };
        self.in_flight = false;

        let (output, status) = frame_output(&raw, &line);
        trace!("{:?} returned {:?} (status {:?})", command, output, status);
        match status {
            Some(0) => Ok(output),
            Some(_) if *tolerate_failure => Ok(output),
            Some(code) => {
                self.fail();
                Err(WrtError::CommandError(format!(
                    "{command} exited with status {code}: {}",
                    output.trim()
                )))
            }
            None => {
                self.fail();
                Err(WrtError::CommandError(format!(
                    "{command}: no exit status before the prompt"
                )))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), WrtError> {
        if self.stream.is_some() {
            if self.state().is_connected() {
                let _ = self.send_line("exit").await;
            }
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.shutdown().await;
            }
            debug!("Closed telnet session to {}", self.target);
        }
        self.in_flight = false;
        self.state = ConnectionState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    const PROMPT: &str = "root@DD-WRT:~# ";
    const LEASE_LINE: &str = "1700000000 aa:bb:cc:dd:ee:01 192.168.1.10 phone *\r\n";

    #[test]
    fn negotiation_is_refused_and_stripped() {
        let mut filter = IacFilter::default();
        let (data, replies) = filter.feed(&[IAC, DO, 24, b'o', b'k', IAC, WILL, 1]);
        assert_eq!(data, b"ok");
        assert_eq!(replies, vec![IAC, WONT, 24, IAC, DONT, 1]);
    }

    #[test]
    fn commands_split_across_reads_are_recognized() {
        let mut filter = IacFilter::default();
        let (data, replies) = filter.feed(&[b'a', IAC]);
        assert_eq!(data, b"a");
        assert!(replies.is_empty());
        let (data, replies) = filter.feed(&[DO, 31, b'b']);
        assert_eq!(data, b"b");
        assert_eq!(replies, vec![IAC, WONT, 31]);
    }

    #[test]
    fn subnegotiation_and_escaped_iac() {
        let mut filter = IacFilter::default();
        let (data, _) = filter.feed(&[IAC, SB, 24, 1, IAC, SE, b'x', IAC, IAC]);
        assert_eq!(data, vec![b'x', IAC]);
    }

    #[test]
    fn command_line_echoes_exit_status() {
        assert_eq!(command_line("arp -n"), "arp -n; echo \"@@rc=$?\"");
    }

    #[test]
    fn output_is_framed_between_echo_and_prompt() {
        let sent = command_line("arp -n");
        let raw = format!(
            "{sent}\r\n? (192.168.1.10) at aa:bb:cc:dd:ee:01 [ether]  on br0\r\n@@rc=0\r\nroot@DD-WRT:~# "
        );
        assert_eq!(
            frame_output(&raw, &sent),
            (
                "? (192.168.1.10) at aa:bb:cc:dd:ee:01 [ether]  on br0\n".to_string(),
                Some(0)
            )
        );

        let sent = command_line("ip neigh");
        let raw = format!("{sent}\r\n@@rc=0\r\nroot@DD-WRT:~# ");
        assert_eq!(frame_output(&raw, &sent), (String::new(), Some(0)));
    }

    #[test]
    fn exit_status_is_taken_out_of_the_output() {
        let sent = command_line("cat /tmp/dnsmasq.leases");
        let raw = format!(
            "{sent}\r\ncat: can't open '/tmp/dnsmasq.leases': No such file or directory\r\n@@rc=1\r\n# "
        );
        let (output, status) = frame_output(&raw, &sent);
        assert_eq!(
            output,
            "cat: can't open '/tmp/dnsmasq.leases': No such file or directory\n"
        );
        assert_eq!(status, Some(1));
    }

    #[test]
    fn output_without_echo_or_marker_keeps_every_line() {
        let raw = "line one\nline two\n# ";
        assert_eq!(
            frame_output(raw, "cat /tmp/dnsmasq.leases"),
            ("line one\nline two\n".to_string(), None)
        );
    }

    #[test]
    fn prompts_are_recognized() {
        assert!(is_login_prompt("DD-WRT login: "));
        assert!(is_password_prompt("Password: "));
        assert!(is_shell_prompt("root@DD-WRT:~# "));
        assert!(!is_shell_prompt(""));
        assert_eq!(clean("\x1b[1;32mroot@DD-WRT\x1b[0m:~# "), "root@DD-WRT:~# ");
    }

    /// What the fake shell does with one command.
    enum Reply {
        /// Prints the text, then exits with the status.
        Output(&'static str, i32),
        /// Never prints anything, prompt included.
        Silence,
    }

    /// One line from the client, with telnet replies and line endings removed.
    async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
        let mut raw = Vec::new();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(None);
        }
        Ok(Some(
            raw.iter()
                .filter(|b| (0x20..0x7f).contains(*b))
                .map(|&b| b as char)
                .collect(),
        ))
    }

    async fn serve_session(
        socket: TcpStream,
        password: &'static str,
        reply: fn(&str) -> Reply,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(&[IAC, DO, 24]).await?;
        writer.write_all(b"DD-WRT login: ").await?;
        if next_line(&mut reader).await?.is_none() {
            return Ok(());
        }
        writer.write_all(b"Password: ").await?;
        let Some(given) = next_line(&mut reader).await? else {
            return Ok(());
        };
        if given != password {
            writer
                .write_all(b"\r\nLogin incorrect\r\nDD-WRT login: ")
                .await?;
            return Ok(());
        }
        writer
            .write_all(format!("\r\nBusyBox v1.36\r\n{PROMPT}").as_bytes())
            .await?;

        while let Some(line) = next_line(&mut reader).await? {
            if line == "exit" {
                break;
            }
            let command = line.strip_suffix("; echo \"@@rc=$?\"").unwrap_or(line.as_str());
            if let Reply::Output(text, rc) = reply(command) {
                let answer = format!("{line}\r\n{text}@@rc={rc}\r\n{PROMPT}");
                writer.write_all(answer.as_bytes()).await?;
            }
        }
        Ok(())
    }

    /// Fake telnet daemon accepting any number of sessions.
    async fn fake_router(password: &'static str, reply: fn(&str) -> Reply) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_session(socket, password, reply));
            }
        });
        port
    }

    fn dd_wrt_shell(command: &str) -> Reply {
        match command {
            "cat /tmp/dnsmasq.leases" => Reply::Output(LEASE_LINE, 0),
            "cat /tmp/missing.leases" => Reply::Output(
                "cat: can't open '/tmp/missing.leases': No such file or directory\r\n",
                1,
            ),
            "wl ver" => Reply::Output("-sh: wl: not found\r\n", 127),
            _ => Reply::Silence,
        }
    }

    fn config(port: u16, password: &str) -> RouterConfig {
        RouterConfig::new("127.0.0.1", TransportKind::Telnet)
            .with_port(port)
            .with_credentials("root", password)
            .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn logs_in_and_runs_a_command() {
        let port = fake_router("secret", dd_wrt_shell).await;
        let mut transport = TelnetTransport::new(&config(port, "secret"));
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(transport.prompt, "root@DD-WRT:~#");

        let output = transport
            .run(&Request::shell("cat /tmp/dnsmasq.leases"))
            .await
            .unwrap();
        assert_eq!(output, "1700000000 aa:bb:cc:dd:ee:01 192.168.1.10 phone *\n");
        assert_eq!(transport.state(), ConnectionState::Connected);

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wrong_password_is_an_authentication_failure() {
        let port = fake_router("secret", dd_wrt_shell).await;
        let mut transport = TelnetTransport::new(&config(port, "wrong"));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, WrtError::AuthenticationFailed(_)));
        assert_eq!(transport.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_command_error() {
        let port = fake_router("secret", dd_wrt_shell).await;
        let mut transport = TelnetTransport::new(&config(port, "secret"));
        transport.connect().await.unwrap();

        let err = transport
            .run(&Request::shell("cat /tmp/missing.leases"))
            .await
            .unwrap_err();
        assert!(matches!(err, WrtError::CommandError(ref msg) if msg.contains("status 1")));
        assert_eq!(transport.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn tolerant_command_returns_output_despite_exit_status() {
        let port = fake_router("secret", dd_wrt_shell).await;
        let mut transport = TelnetTransport::new(&config(port, "secret"));
        transport.connect().await.unwrap();

        let output = transport.run(&Request::probe("wl ver")).await.unwrap();
        assert_eq!(output, "-sh: wl: not found\n");
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn command_without_prompt_times_out_and_fails() {
        let port = fake_router("secret", dd_wrt_shell).await;
        let mut transport = TelnetTransport::new(
            &config(port, "secret").with_timeout(Duration::from_secs(1)),
        );
        transport.connect().await.unwrap();

        let err = transport.run(&Request::shell("ip neigh")).await.unwrap_err();
        assert!(matches!(err, WrtError::ExecTimeout(_)));
        assert_eq!(transport.state(), ConnectionState::Failed);

        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn abandoned_command_leaves_transport_failed() {
        let port = fake_router("secret", dd_wrt_shell).await;
        let mut transport = TelnetTransport::new(&config(port, "secret"));
        transport.connect().await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            transport.run(&Request::shell("ip neigh")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(transport.state(), ConnectionState::Failed);
        assert!(matches!(
            transport.run(&Request::shell("arp -n")).await,
            Err(WrtError::NotConnected)
        ));

        transport.connect().await.unwrap();
        let output = transport
            .run(&Request::shell("cat /tmp/dnsmasq.leases"))
            .await
            .unwrap();
        assert!(output.contains("aa:bb:cc:dd:ee:01"));
    }

    #[tokio::test]
    async fn abandoned_connect_leaves_transport_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accepts and never greets.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let mut transport = TelnetTransport::new(&config(port, "secret"));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(200), transport.connect()).await;
        assert!(abandoned.is_err());
        assert_eq!(transport.state(), ConnectionState::Failed);
        assert!(matches!(
            transport.run(&Request::shell("arp -n")).await,
            Err(WrtError::NotConnected)
        ));
    }
}
