use base64::{engine::general_purpose, Engine as _};
use mailshield_utils::{
    build_router, is_ip_allowed, load_config_or_default, load_tls_server_config, AuthEngine,
    Config, IncomingMessage, IpMask, MemoryAuthEngine, MessageRouter, RelayMetrics, STEP_AUTH,
    STEP_CONNECTION, STEP_DATA, STEP_DELIVERY,
};
use regex::Regex;
use std::{
    env,
    error::Error,
    future::Future,
    io::{self, ErrorKind},
    mem::take,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "MAILSHIELD_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Longest command line accepted, terminator included.
const MAX_COMMAND_LINE: usize = 1000;

/// Settings and collaborators shared by every SMTP session.
struct ServerContext {
    hostname: String,
    welcome_message: String,
    auth_required: bool,
    max_message_size: usize,
    max_recipients: usize,
    sender_patterns: Vec<Regex>,
    recipient_patterns: Vec<Regex>,
    auth: Option<Arc<dyn AuthEngine>>,
    tls: Option<TlsAcceptor>,
    force_tls: bool,
    allowed_nets: Vec<IpMask>,
    connections: Option<Arc<Semaphore>>,
    read_timeout: Duration,
    write_timeout: Duration,
    data_timeout: Duration,
    metrics: Arc<RelayMetrics>,
    router: MessageRouter,
}

impl ServerContext {
    fn from_config(config: &Config) -> Result<Self, Box<dyn Error>> {
        let smtp = &config.smtp;

        let credentials_path = Path::new(&smtp.auth.credentials_file);
        let auth: Option<Arc<dyn AuthEngine>> = if smtp.auth_required || credentials_path.exists()
        {
            Some(Arc::new(MemoryAuthEngine::from_file(credentials_path)?))
        } else {
            None
        };

        let tls = if smtp.tls.enabled {
            let tls_config = load_tls_server_config(&smtp.tls.cert, &smtp.tls.key)
                .map_err(|e| format!("failed to load TLS certificate: {e}"))?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            None
        };
        if smtp.force_tls && tls.is_none() {
            return Err("force_tls requires [smtp.tls] to be enabled".into());
        }

        Ok(Self {
            hostname: smtp.hostname.clone(),
            welcome_message: smtp.welcome_message.clone(),
            auth_required: smtp.auth_required,
            max_message_size: smtp.max_message_size,
            max_recipients: smtp.max_recipients,
            sender_patterns: smtp.sender_patterns()?,
            recipient_patterns: smtp.recipient_patterns()?,
            auth,
            tls,
            force_tls: smtp.force_tls,
            allowed_nets: smtp.allowed_nets()?,
            connections: smtp
                .connection_limit()
                .map(|limit| Arc::new(Semaphore::new(limit))),
            read_timeout: Duration::from_secs(smtp.read_timeout_secs),
            write_timeout: Duration::from_secs(smtp.write_timeout_secs),
            data_timeout: Duration::from_secs(smtp.data_timeout_secs),
            metrics: Arc::new(RelayMetrics::new()?),
            router: build_router(config)?,
        })
    }

    /// Checks a new client against the network allow-list and the session
    /// limit, the permit is held until the session ends.
    fn admit(&self, ip: IpAddr) -> Result<Option<OwnedSemaphorePermit>, Refusal> {
        if !is_ip_allowed(&self.allowed_nets, &ip) {
            return Err(Refusal::Denied);
        }
        match &self.connections {
            Some(connections) => connections
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| Refusal::Busy),
            None => Ok(None),
        }
    }
}

/// Reason a connection is turned away before the greeting.
#[derive(Debug, PartialEq, Eq)]
enum Refusal {
    /// The client address is outside `allowed_nets`.
    Denied,
    /// Every session slot is taken.
    Busy,
}

impl Refusal {
    fn reply(&self, hostname: &str) -> String {
        match self {
            Refusal::Denied => format!("421 {hostname} Denied\r\n"),
            Refusal::Busy => format!("421 {hostname} Too busy, try again later\r\n"),
        }
    }
}

/// Outcome of a bounded line read.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    /// The line exceeded the limit and was discarded.
    TooLong,
    Eof,
}

/// Outcome of a processed command, tells the connection loop what to do next.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    StartTls,
    Quit,
    Closed,
}

/// Represents a single SMTP session, created for each incoming connection.
///
/// Holds the envelope being built, the authentication state and whether
/// the connection was upgraded with `STARTTLS`.
struct SmtpSession {
    context: Arc<ServerContext>,
    client_ip: Option<IpAddr>,
    helo_domain: Option<String>,
    from: Option<String>,
    rcpts: Vec<String>,
    authenticated: bool,
    tls: bool,
}

impl SmtpSession {
    fn new(context: Arc<ServerContext>, client_ip: Option<IpAddr>) -> Self {
        Self {
            context,
            client_ip,
            helo_domain: None,
            from: None,
            rcpts: Vec::new(),
            authenticated: false,
            tls: false,
        }
    }

    fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }

    async fn greet<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut BufReader<S>,
    ) -> io::Result<()> {
        let greeting = format!(
            "{} ESMTP {}",
            self.context.hostname, self.context.welcome_message
        );
        self.write_response(stream, 220, &greeting).await
    }

    /// Reads and answers commands until the client quits, disconnects or
    /// asks for a TLS upgrade.
    async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
    ) -> io::Result<Flow> {
        let mut line = Vec::with_capacity(512);
        loop {
            match read_line(stream, &mut line, MAX_COMMAND_LINE, self.context.read_timeout).await {
                Ok(LineRead::Line) => (),
                Ok(LineRead::TooLong) => {
                    self.write_response(stream, 500, "Line too long").await?;
                    continue;
                }
                Ok(LineRead::Eof) => return Ok(Flow::Closed),
                Err(error) if error.kind() == ErrorKind::TimedOut => {
                    return self.time_out(stream).await
                }
                Err(error) => return Err(error),
            }
            let text = String::from_utf8_lossy(&line).into_owned();
            let (command, arg) = parse_command(&text);
            debug!(tls = self.tls, command = %command, "Received command");

            match self.handle_command(stream, &command, arg).await? {
                Flow::Continue => continue,
                flow => return Ok(flow),
            }
        }
    }

    async fn time_out<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut BufReader<S>,
    ) -> io::Result<Flow> {
        warn!(client = ?self.client_ip, "Session timed out");
        self.context.metrics.error(STEP_CONNECTION);
        let reply = format!("{} Timeout, closing connection", self.context.hostname);
        self.write_response(stream, 421, &reply).await?;
        Ok(Flow::Closed)
    }

    /// Base handler for the SMTP commands, dispatching to the specific ones.
    async fn handle_command<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
        command: &str,
        arg: &str,
    ) -> io::Result<Flow> {
        match command {
            "EHLO" => self.handle_ehlo(stream, arg, true).await?,
            "HELO" => self.handle_ehlo(stream, arg, false).await?,
            "STARTTLS" => return self.handle_starttls(stream).await,
            "AUTH" => return self.handle_auth(stream, arg).await,
            "MAIL" => self.handle_mail(stream, arg).await?,
            "RCPT" => self.handle_rcpt(stream, arg).await?,
            "DATA" => return self.handle_data(stream).await,
            "RSET" => {
                self.reset();
                self.write_response(stream, 250, "OK").await?;
            }
            "NOOP" => self.write_response(stream, 250, "OK").await?,
            "QUIT" => {
                self.write_response(stream, 221, "Bye").await?;
                return Ok(Flow::Quit);
            }
            _ => {
                self.write_response(stream, 502, "Command not implemented")
                    .await?
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_ehlo<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
        arg: &str,
        extended: bool,
    ) -> io::Result<()> {
        if arg.is_empty() {
            return self
                .write_response(stream, 501, "Syntax error in parameters or arguments")
                .await;
        }
        self.helo_domain = Some(arg.to_string());
        self.reset();

        let greeting = format!("{} greets {arg}", self.context.hostname);
        if !extended {
            return self.write_response(stream, 250, &greeting).await;
        }

        let size = format!("SIZE {}", self.context.max_message_size);
        let mut lines = vec![greeting.as_str(), "8BITMIME", size.as_str()];
        if self.context.tls.is_some() && !self.tls {
            lines.push("STARTTLS");
        }
        if self.context.auth.is_some() && !self.requires_tls() {
            lines.push("AUTH LOGIN");
        }
        self.write_multiple(stream, 250, &lines).await
    }

    async fn handle_starttls<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
    ) -> io::Result<Flow> {
        if self.tls {
            self.write_response(stream, 503, "TLS already active")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.context.tls.is_none() {
            self.write_response(stream, 502, "Command not implemented")
                .await?;
            return Ok(Flow::Continue);
        }
        self.write_response(stream, 220, "Ready to start TLS")
            .await?;
        Ok(Flow::StartTls)
    }

    async fn handle_auth<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
        arg: &str,
    ) -> io::Result<Flow> {
        let Some(engine) = self.context.auth.clone() else {
            self.write_response(stream, 502, "Command not implemented")
                .await?;
            return Ok(Flow::Continue);
        };
        if self.requires_tls() {
            self.write_response(stream, 530, "Must issue a STARTTLS command first")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.authenticated {
            self.write_response(stream, 503, "Already authenticated")
                .await?;
            return Ok(Flow::Continue);
        }

        let mut parts = arg.split_whitespace();
        if !parts
            .next()
            .is_some_and(|mechanism| mechanism.eq_ignore_ascii_case("LOGIN"))
        {
            self.write_response(stream, 504, "Unrecognized authentication type")
                .await?;
            return Ok(Flow::Continue);
        }

        let username = match parts.next() {
            Some(initial) => initial.to_string(),
            None => match self.challenge(stream, "VXNlcm5hbWU6").await? {
                Some(answer) => answer,
                None => return Ok(Flow::Closed),
            },
        };
        let password = match self.challenge(stream, "UGFzc3dvcmQ6").await? {
            Some(answer) => answer,
            None => return Ok(Flow::Closed),
        };
        if username == "*" || password == "*" {
            self.write_response(stream, 501, "Authentication cancelled")
                .await?;
            return Ok(Flow::Continue);
        }
        if username.is_empty() || password.is_empty() {
            self.write_response(stream, 501, "Syntax error in parameters or arguments")
                .await?;
            return Ok(Flow::Continue);
        }

        let (Some(username), Some(password)) = (decode_login(&username), decode_login(&password))
        else {
            self.write_response(stream, 501, "Invalid base64 encoding")
                .await?;
            return Ok(Flow::Continue);
        };

        match engine.authenticate(&username, &password) {
            Ok(()) => {
                info!(username = %username, "Authenticated client");
                self.authenticated = true;
                self.write_response(stream, 235, "Authentication successful")
                    .await?;
            }
            Err(error) => {
                warn!(username = %username, error = %error, "Authentication failed");
                self.context.metrics.error(STEP_AUTH);
                self.write_response(stream, 535, "Authentication failed")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Sends a `334` challenge and returns the trimmed answer, empty when
    /// overlong and `None` when the session is over.
    async fn challenge<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut BufReader<S>,
        prompt: &str,
    ) -> io::Result<Option<String>> {
        self.write_response(stream, 334, prompt).await?;
        let mut line = Vec::new();
        match read_line(stream, &mut line, MAX_COMMAND_LINE, self.context.read_timeout).await {
            Ok(LineRead::Line) => Ok(Some(String::from_utf8_lossy(&line).trim().to_string())),
            Ok(LineRead::TooLong) => Ok(Some(String::new())),
            Ok(LineRead::Eof) => Ok(None),
            Err(error) if error.kind() == ErrorKind::TimedOut => {
                self.time_out(stream).await?;
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    fn requires_auth(&self) -> bool {
        self.context.auth_required && !self.authenticated
    }

    fn requires_tls(&self) -> bool {
        self.context.force_tls && !self.tls
    }

    async fn handle_mail<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
        arg: &str,
    ) -> io::Result<()> {
        if self.requires_tls() {
            return self
                .write_response(stream, 530, "Must issue a STARTTLS command first")
                .await;
        }
        if self.requires_auth() {
            return self
                .write_response(stream, 530, "Authentication required")
                .await;
        }
        if self.from.is_some() {
            return self
                .write_response(stream, 503, "Sender already specified")
                .await;
        }
        let Some((from, params)) = parse_path(arg, "FROM:") else {
            return self
                .write_response(stream, 501, "Syntax error in parameters or arguments")
                .await;
        };
        if declared_size(params).is_some_and(|size| size > self.context.max_message_size) {
            return self
                .write_response(stream, 552, "Message size exceeds fixed maximum message size")
                .await;
        }
        if !is_allowed(&self.context.sender_patterns, &from) {
            warn!(from = %from, "Sender not allowed");
            return self
                .write_response(stream, 550, "Sender address rejected")
                .await;
        }

        self.from = Some(from);
        self.write_response(stream, 250, "OK").await
    }

    async fn handle_rcpt<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
        arg: &str,
    ) -> io::Result<()> {
        if self.requires_tls() {
            return self
                .write_response(stream, 530, "Must issue a STARTTLS command first")
                .await;
        }
        if self.requires_auth() {
            return self
                .write_response(stream, 530, "Authentication required")
                .await;
        }
        if self.from.is_none() {
            return self.write_response(stream, 503, "Need MAIL command").await;
        }
        let Some((rcpt, _)) = parse_path(arg, "TO:").filter(|(rcpt, _)| !rcpt.is_empty()) else {
            return self
                .write_response(stream, 501, "Syntax error in parameters or arguments")
                .await;
        };
        if !is_allowed(&self.context.recipient_patterns, &rcpt) {
            warn!(rcpt = %rcpt, "Recipient not allowed");
            return self
                .write_response(stream, 550, "Recipient address rejected")
                .await;
        }
        if self.rcpts.iter().any(|existing| existing.eq_ignore_ascii_case(&rcpt)) {
            return self.write_response(stream, 250, "OK").await;
        }
        if self.rcpts.len() >= self.context.max_recipients {
            return self
                .write_response(stream, 452, "Too many recipients")
                .await;
        }

        self.rcpts.push(rcpt);
        self.write_response(stream, 250, "OK").await
    }

    async fn handle_data<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        stream: &mut BufReader<S>,
    ) -> io::Result<Flow> {
        if self.requires_tls() {
            self.write_response(stream, 530, "Must issue a STARTTLS command first")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.requires_auth() {
            self.write_response(stream, 530, "Authentication required")
                .await?;
            return Ok(Flow::Continue);
        }
        if self.from.is_none() {
            self.write_response(stream, 503, "Need MAIL command").await?;
            return Ok(Flow::Continue);
        }
        if self.rcpts.is_empty() {
            self.write_response(stream, 554, "No valid recipients")
                .await?;
            return Ok(Flow::Continue);
        }

        self.write_response(stream, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let mut data = Vec::new();
        let mut line = Vec::with_capacity(1024);
        let mut oversized = false;
        let line_limit = self.context.max_message_size.saturating_add(2);
        loop {
            match read_line(stream, &mut line, line_limit, self.context.data_timeout).await {
                Ok(LineRead::Line) => (),
                Ok(LineRead::TooLong) => {
                    oversized = true;
                    continue;
                }
                Ok(LineRead::Eof) => return Ok(Flow::Closed),
                Err(error) if error.kind() == ErrorKind::TimedOut => {
                    self.reset();
                    return self.time_out(stream).await;
                }
                Err(error) => return Err(error),
            }
            if is_data_terminator(&line) {
                break;
            }
            let content = unstuff(&line);
            if oversized || data.len() + content.len() > self.context.max_message_size {
                oversized = true;
                continue;
            }
            data.extend_from_slice(content);
        }

        let incoming = IncomingMessage {
            from: self.from.take().unwrap_or_default(),
            rcpts: take(&mut self.rcpts),
            raw: data,
            client_ip: self.client_ip,
            helo_domain: self.helo_domain.clone(),
        };

        if oversized {
            warn!(from = %incoming.from, "Message exceeds the size limit");
            self.context.metrics.error(STEP_DATA);
            self.write_response(stream, 552, "Message size exceeds fixed maximum message size")
                .await?;
            return Ok(Flow::Continue);
        }

        match self.context.router.route_incoming(&incoming).await {
            Ok(message_id) => {
                info!(
                    message_id = %message_id,
                    from = %incoming.from,
                    rcpts = incoming.rcpts.len(),
                    size = incoming.raw.len(),
                    "Accepted email"
                );
                self.write_response(stream, 250, &format!("OK queued as {message_id}"))
                    .await?;
            }
            Err(error) => {
                error!(from = %incoming.from, error = %error, "Failed to process email");
                self.context.metrics.error(STEP_DELIVERY);
                self.write_response(stream, 554, "Transaction failed")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn write_inner<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut BufReader<S>,
        code: u16,
        message: &str,
        separator: &str,
    ) -> io::Result<()> {
        trace!(tls = self.tls, ">> {code}{separator}{message}");
        let line = format!("{code}{separator}{message}\r\n");
        with_timeout(
            self.context.write_timeout,
            stream.get_mut().write_all(line.as_bytes()),
        )
        .await
    }

    async fn write_response<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut BufReader<S>,
        code: u16,
        message: &str,
    ) -> io::Result<()> {
        self.write_inner(stream, code, message, " ").await?;
        with_timeout(self.context.write_timeout, stream.get_mut().flush()).await
    }

    async fn write_multiple<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut BufReader<S>,
        code: u16,
        messages: &[&str],
    ) -> io::Result<()> {
        for (index, message) in messages.iter().enumerate() {
            let is_last = index == messages.len() - 1;
            let separator = if is_last { " " } else { "-" };
            self.write_inner(stream, code, message, separator).await?;
        }
        with_timeout(self.context.write_timeout, stream.get_mut().flush()).await
    }
}

/// Fails with `TimedOut` when `operation` does not complete within `duration`.
async fn with_timeout<T>(
    duration: Duration,
    operation: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    timeout(duration, operation)
        .await
        .map_err(|_| io::Error::new(ErrorKind::TimedOut, "SMTP session timed out"))?
}

/// Reads one line including its terminator within `wait`, keeping at most
/// `limit` bytes.
async fn read_line<S: AsyncRead + Unpin>(
    stream: &mut BufReader<S>,
    line: &mut Vec<u8>,
    limit: usize,
    wait: Duration,
) -> io::Result<LineRead> {
    with_timeout(wait, read_bounded(stream, line, limit)).await
}

/// An overlong line is drained up to its terminator and never buffered.
async fn read_bounded<S: AsyncRead + Unpin>(
    stream: &mut BufReader<S>,
    line: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    line.clear();
    let mut overflow = false;
    loop {
        let available = stream.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (overflow, line.is_empty()) {
                (true, _) => LineRead::TooLong,
                (false, true) => LineRead::Eof,
                (false, false) => LineRead::Line,
            });
        }
        let (used, complete) = match available.iter().position(|byte| *byte == b'\n') {
            Some(index) => (index + 1, true),
            None => (available.len(), false),
        };
        if !overflow && line.len() + used <= limit {
            line.extend_from_slice(&available[..used]);
        } else {
            overflow = true;
            line.clear();
        }
        stream.consume(used);
        if complete {
            return Ok(if overflow {
                LineRead::TooLong
            } else {
                LineRead::Line
            });
        }
    }
}

/// Splits a command line into its upper-cased verb and the remaining argument.
fn parse_command(line: &str) -> (String, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((command, arg)) => (command.to_ascii_uppercase(), arg.trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    }
}

/// Parses the `FROM:`/`TO:` argument of `MAIL`/`RCPT`, returning the path
/// without angle brackets and the trailing ESMTP parameters.
fn parse_path<'a>(arg: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    let head = arg.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = arg[prefix.len()..].trim_start();
    let (path, params) = match rest.strip_prefix('<') {
        Some(inner) => {
            let end = inner.find('>')?;
            (&inner[..end], inner[end + 1..].trim())
        }
        None => match rest.split_once(' ') {
            Some((path, params)) => (path, params.trim()),
            None => (rest, ""),
        },
    };
    Some((path.trim().to_string(), params))
}

/// Returns the value of the `SIZE=` ESMTP parameter, if declared.
fn declared_size(params: &str) -> Option<usize> {
    params.split_whitespace().find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}

/// An empty allow-list accepts every address.
fn is_allowed(patterns: &[Regex], address: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|pattern| pattern.is_match(address))
}

fn is_data_terminator(line: &[u8]) -> bool {
    line == b".\r\n" || line == b".\n"
}

/// Removes the transparency dot of a `DATA` line.
fn unstuff(line: &[u8]) -> &[u8] {
    match line.strip_prefix(b".") {
        Some(rest) if rest.starts_with(b".") => rest,
        _ => line,
    }
}

fn decode_login(value: &str) -> Option<String> {
    let bytes = general_purpose::STANDARD.decode(value).ok()?;
    String::from_utf8(bytes).ok()
}

async fn handle_connection(
    mut stream: TcpStream,
    address: SocketAddr,
    context: Arc<ServerContext>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let _permit = match context.admit(address.ip()) {
        Ok(permit) => permit,
        Err(refusal) => {
            warn!(client = %address, refusal = ?refusal, "Connection refused");
            context.metrics.error(STEP_CONNECTION);
            stream
                .write_all(refusal.reply(&context.hostname).as_bytes())
                .await?;
            return Ok(());
        }
    };

    let mut session = SmtpSession::new(context.clone(), Some(address.ip()));
    let mut reader = BufReader::new(stream);
    session.greet(&mut reader).await?;

    if session.serve(&mut reader).await? != Flow::StartTls {
        return Ok(());
    }
    let Some(acceptor) = context.tls.clone() else {
        return Ok(());
    };

    // pipelined plaintext is dropped with the buffer
    let tls_stream = acceptor.accept(reader.into_inner()).await?;
    debug!(client = %address, "TLS handshake complete");
    session.tls = true;
    session.helo_domain = None;
    session.reset();

    let mut reader = BufReader::new(tls_stream);
    session.serve(&mut reader).await?;
    Ok(())
}

/// Answers every HTTP request on `listener` with the metrics in the
/// Prometheus text format.
async fn serve_metrics(listener: TcpListener, metrics: Arc<RelayMetrics>) {
    loop {
        let (mut stream, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(error = %error, "Failed to accept metrics connection");
                continue;
            }
        };
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut request = [0u8; 1024];
            if let Err(error) = stream.read(&mut request).await {
                debug!(client = %address, error = %error, "Failed to read metrics request");
                return;
            }
            let (status, body) = match metrics.render() {
                Ok(body) => ("200 OK", body),
                Err(error) => ("500 Internal Server Error", error.to_string()),
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            if let Err(error) = stream.write_all(response.as_bytes()).await {
                debug!(client = %address, error = %error, "Failed to write metrics");
            }
        });
    }
}

/// Resolves the configuration path from the first argument, then the
/// environment, then the working directory.
fn config_path() -> PathBuf {
    env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let path = config_path();
    let config = load_config_or_default(&path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(path = %path.display(), "Configuration loaded");

    let context = Arc::new(ServerContext::from_config(&config)?);

    if let Some(address) = &config.smtp.metrics_address {
        let listener = TcpListener::bind(address).await?;
        info!(address = %address, "Serving metrics");
        tokio::spawn(serve_metrics(listener, context.metrics.clone()));
    }

    let listening = format!("{}:{}", config.smtp.host, config.smtp.port);
    let listener = TcpListener::bind(&listening).await?;
    info!(
        address = %listening,
        tls = context.tls.is_some(),
        force_tls = context.force_tls,
        auth_required = context.auth_required,
        allowed_nets = context.allowed_nets.len(),
        "Mailshield SMTP running"
    );

    loop {
        let (stream, address) = listener.accept().await?;
        let context = context.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, address, context).await {
                warn!(client = %address, error = %error, "Session ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use mailshield_utils::{EmailMessage, HandlerError, HandlerFuture, MessageHandler};
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[derive(Default)]
    struct CaptureHandler {
        messages: Mutex<Vec<(String, Vec<String>, Vec<u8>)>>,
    }

    impl MessageHandler for CaptureHandler {
        fn handle<'a>(&'a self, message: &'a EmailMessage) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.messages.lock().unwrap().push((
                    message.from.clone(),
                    message.rcpts.clone(),
                    message.raw_bytes(),
                ));
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "capture"
        }
    }

    struct FailingHandler;

    impl MessageHandler for FailingHandler {
        fn handle<'a>(&'a self, _message: &'a EmailMessage) -> HandlerFuture<'a> {
            Box::pin(async { Err(HandlerError::Delivery("upstream down".to_string())) })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn context(handler: Arc<CaptureHandler>) -> ServerContext {
        let mut credentials = HashMap::new();
        credentials.insert("user".to_string(), "pass".to_string());
        ServerContext {
            hostname: "mx.test".to_string(),
            welcome_message: "ready".to_string(),
            auth_required: false,
            max_message_size: 64,
            max_recipients: 2,
            sender_patterns: Vec::new(),
            recipient_patterns: vec![Regex::new("@example\\.com$").unwrap()],
            auth: Some(Arc::new(MemoryAuthEngine::from_map(credentials))),
            tls: None,
            force_tls: false,
            allowed_nets: Vec::new(),
            connections: None,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            data_timeout: Duration::from_secs(5),
            metrics: Arc::new(RelayMetrics::new().unwrap()),
            router: MessageRouter::new(vec![], handler, vec![]),
        }
    }

    fn codes(output: &str) -> Vec<&str> {
        output.lines().map(|line| &line[..3]).collect()
    }

    /// Runs a whole pipelined conversation and returns the server replies.
    async fn converse(context: ServerContext, script: impl AsRef<[u8]>) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let context = Arc::new(context);
        let task = tokio::spawn(async move {
            let mut session = SmtpSession::new(context, None);
            let mut reader = BufReader::new(server);
            session.greet(&mut reader).await.unwrap();
            session.serve(&mut reader).await.unwrap()
        });

        client.write_all(script.as_ref()).await.unwrap();
        client.shutdown().await.unwrap();
        let flow = task.await.unwrap();
        assert_ne!(flow, Flow::StartTls);

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        output
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("mail FROM:<a@b.c>\r\n"),
            ("MAIL".to_string(), "FROM:<a@b.c>")
        );
        assert_eq!(parse_command("QUIT\r\n"), ("QUIT".to_string(), ""));
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("FROM:<a@example.com> SIZE=100", "FROM:"),
            Some(("a@example.com".to_string(), "SIZE=100"))
        );
        assert_eq!(
            parse_path("to: <b@example.com>", "TO:"),
            Some(("b@example.com".to_string(), ""))
        );
        assert_eq!(
            parse_path("FROM:<>", "FROM:"),
            Some((String::new(), ""))
        );
        assert_eq!(parse_path("FROM:a@example.com", "FROM:").unwrap().0, "a@example.com");
        assert_eq!(parse_path("FROM:<a@example.com", "FROM:"), None);
        assert_eq!(parse_path("TO:<a@example.com>", "FROM:"), None);
    }

    #[test]
    fn test_declared_size() {
        assert_eq!(declared_size("BODY=8BITMIME SIZE=1024"), Some(1024));
        assert_eq!(declared_size("BODY=8BITMIME"), None);
    }

    #[test]
    fn test_is_allowed() {
        let patterns = vec![Regex::new("@example\\.com$").unwrap()];
        assert!(is_allowed(&[], "anyone@anywhere.org"));
        assert!(is_allowed(&patterns, "a@example.com"));
        assert!(!is_allowed(&patterns, "a@example.org"));
    }

    #[test]
    fn test_unstuff() {
        assert_eq!(unstuff(b"..hidden\r\n"), b".hidden\r\n");
        assert_eq!(unstuff(b".\r\n"), b".\r\n");
        assert_eq!(unstuff(b"plain\r\n"), b"plain\r\n");
        assert!(is_data_terminator(b".\r\n"));
        assert!(!is_data_terminator(b"..\r\n"));
    }

    #[test]
    fn test_decode_login() {
        assert_eq!(decode_login("dXNlcg=="), Some("user".to_string()));
        assert_eq!(decode_login("not base64!"), None);
    }

    #[tokio::test]
    async fn test_session_delivers_message() {
        let handler = Arc::new(CaptureHandler::default());
        let output = converse(
            context(handler.clone()),
            "EHLO client.test\r\n\
             MAIL FROM:<sender@test.org>\r\n\
             RCPT TO:<a@example.com>\r\n\
             RCPT TO:<A@example.com>\r\n\
             DATA\r\n\
             Subject: hi\r\n\
             \r\n\
             ..dot\r\n\
             .\r\n\
             QUIT\r\n",
        )
        .await;

        assert!(output.starts_with("220 mx.test ESMTP ready\r\n"));
        assert!(output.contains("250-mx.test greets client.test\r\n"));
        assert!(output.contains("250 AUTH LOGIN\r\n"));
        assert!(!output.contains("STARTTLS"));
        assert!(output.contains("354 "));
        assert!(output.contains("250 OK queued as "));
        assert!(output.ends_with("221 Bye\r\n"));

        let messages = handler.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "sender@test.org");
        assert_eq!(messages[0].1, vec!["a@example.com".to_string()]);
        assert_eq!(messages[0].2, b"Subject: hi\r\n\r\n.dot\r\n");
    }

    #[tokio::test]
    async fn test_session_rejections() {
        let handler = Arc::new(CaptureHandler::default());
        let output = converse(
            context(handler.clone()),
            "HELO client.test\r\n\
             RCPT TO:<a@example.com>\r\n\
             DATA\r\n\
             MAIL FROM:<sender@test.org>\r\n\
             RCPT TO:<a@example.org>\r\n\
             RCPT TO:<a@example.com>\r\n\
             RCPT TO:<b@example.com>\r\n\
             RCPT TO:<c@example.com>\r\n\
             VRFY a\r\n\
             QUIT\r\n",
        )
        .await;

        let codes: Vec<&str> = output.lines().map(|line| &line[..3]).collect();
        assert_eq!(
            codes,
            vec!["220", "250", "503", "503", "250", "550", "250", "250", "452", "502", "221"]
        );
        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_message_too_large() {
        let handler = Arc::new(CaptureHandler::default());
        let body = "x".repeat(100);
        let output = converse(
            context(handler.clone()),
            &format!(
                "HELO c\r\nMAIL FROM:<s@test.org>\r\nRCPT TO:<a@example.com>\r\nDATA\r\n{body}\r\n.\r\nMAIL FROM:<s@test.org> SIZE=1000\r\nQUIT\r\n"
            ),
        )
        .await;

        let codes: Vec<&str> = output.lines().map(|line| &line[..3]).collect();
        assert_eq!(codes, vec!["220", "250", "250", "250", "354", "552", "552", "221"]);
        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_auth_login() {
        let handler = Arc::new(CaptureHandler::default());
        let mut context = context(handler);
        context.auth_required = true;
        let output = converse(
            context,
            "EHLO c\r\n\
             MAIL FROM:<s@test.org>\r\n\
             AUTH LOGIN\r\n\
             dXNlcg==\r\n\
             d3Jvbmc=\r\n\
             AUTH LOGIN dXNlcg==\r\n\
             cGFzcw==\r\n\
             MAIL FROM:<s@test.org>\r\n\
             QUIT\r\n",
        )
        .await;

        let codes: Vec<&str> = output.lines().map(|line| &line[..3]).collect();
        assert_eq!(
            codes,
            vec![
                "220", "250", "250", "250", "250", "530", "334", "334", "535", "334", "235",
                "250", "221"
            ]
        );
    }

    #[tokio::test]
    async fn test_session_client_disconnects() {
        let handler = Arc::new(CaptureHandler::default());
        let output = converse(
            context(handler.clone()),
            "HELO c\r\nMAIL FROM:<s@test.org>\r\nRCPT TO:<a@example.com>\r\nDATA\r\npartial\r\n",
        )
        .await;

        assert!(output.ends_with("354 End data with <CR><LF>.<CR><LF>\r\n"));
        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_keeps_eight_bit_data() {
        let handler = Arc::new(CaptureHandler::default());
        let mut script = b"EHLO c\r\n\
            MAIL FROM:<s@test.org> BODY=8BITMIME\r\n\
            RCPT TO:<a@example.com>\r\n\
            DATA\r\n"
            .to_vec();
        let body = b"Content-Type: text/plain; charset=iso-8859-1\r\n\r\ncaf\xe9\r\n";
        script.extend_from_slice(body);
        script.extend_from_slice(b".\r\nQUIT\r\n");

        let mut context = context(handler.clone());
        context.max_message_size = 1024;
        let output = converse(context, script).await;

        assert!(output.contains("250 OK queued as "));
        let messages = handler.messages.lock().unwrap();
        assert_eq!(messages[0].2, body);
    }

    #[tokio::test]
    async fn test_session_overlong_command_line() {
        let handler = Arc::new(CaptureHandler::default());
        let script = format!(
            "HELO c\r\nNOOP {}\r\nNOOP\r\nMAIL FROM:{}",
            "x".repeat(5000),
            "y".repeat(64 * 1024)
        );

        let output = converse(context(handler), script).await;

        assert_eq!(codes(&output), vec!["220", "250", "500", "250", "500"]);
    }

    #[tokio::test]
    async fn test_session_overlong_data_line() {
        let handler = Arc::new(CaptureHandler::default());
        let script = format!(
            "HELO c\r\nMAIL FROM:<s@test.org>\r\nRCPT TO:<a@example.com>\r\nDATA\r\n{}\r\n.\r\nQUIT\r\n",
            "z".repeat(32 * 1024)
        );

        let output = converse(context(handler.clone()), script).await;

        assert_eq!(codes(&output), vec!["220", "250", "250", "250", "354", "552", "221"]);
        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_bounded_without_terminator() {
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut line = Vec::new();
            let first = read_bounded(&mut reader, &mut line, 100).await.unwrap();
            let second = read_bounded(&mut reader, &mut line, 100).await.unwrap();
            (first, second, line.len())
        });

        client.write_all(&[b'a'; 4096]).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(task.await.unwrap(), (LineRead::TooLong, LineRead::Eof, 0));
    }

    #[tokio::test]
    async fn test_session_idle_timeout() {
        let handler = Arc::new(CaptureHandler::default());
        let mut context = context(handler);
        context.read_timeout = Duration::from_millis(50);
        let metrics = context.metrics.clone();
        let context = Arc::new(context);

        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(async move {
            let mut session = SmtpSession::new(context, None);
            let mut reader = BufReader::new(server);
            session.greet(&mut reader).await.unwrap();
            session.serve(&mut reader).await.unwrap()
        });
        client.write_all(b"HELO c\r\n").await.unwrap();

        assert_eq!(task.await.unwrap(), Flow::Closed);
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert!(output.ends_with("421 mx.test Timeout, closing connection\r\n"));
        assert_eq!(metrics.errors(STEP_CONNECTION), 1);
    }

    #[tokio::test]
    async fn test_session_force_tls() {
        let handler = Arc::new(CaptureHandler::default());
        let mut context = context(handler);
        context.force_tls = true;
        let output = converse(
            context,
            "EHLO c\r\n\
             MAIL FROM:<s@test.org>\r\n\
             AUTH LOGIN\r\n\
             RCPT TO:<a@example.com>\r\n\
             DATA\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(
            codes(&output),
            vec!["220", "250", "250", "250", "530", "530", "530", "530", "221"]
        );
        assert!(!output.contains("AUTH LOGIN"));
        assert!(output.contains("530 Must issue a STARTTLS command first\r\n"));
    }

    #[test]
    fn test_admit() {
        let handler = Arc::new(CaptureHandler::default());
        let mut context = context(handler);
        context.allowed_nets = vec!["127.0.0.0/8".parse().unwrap()];
        context.connections = Some(Arc::new(Semaphore::new(1)));
        let local: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(matches!(
            context.admit("10.0.0.1".parse().unwrap()),
            Err(Refusal::Denied)
        ));
        let permit = context.admit(local).unwrap();
        assert!(permit.is_some());
        assert!(matches!(context.admit(local), Err(Refusal::Busy)));
        drop(permit);
        assert!(matches!(context.admit(local), Ok(Some(_))));
        assert_eq!(Refusal::Busy.reply("mx"), "421 mx Too busy, try again later\r\n");
    }

    #[tokio::test]
    async fn test_connection_outside_allowed_nets() {
        let handler = Arc::new(CaptureHandler::default());
        let mut context = context(handler);
        context.allowed_nets = vec!["10.0.0.0/8".parse().unwrap()];
        let metrics = context.metrics.clone();
        let context = Arc::new(context);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, address) = listener.accept().await.unwrap();
            handle_connection(stream, address, context).await.unwrap();
        });

        let mut client = TcpStream::connect(local).await.unwrap();
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        server.await.unwrap();

        assert_eq!(output, "421 mx.test Denied\r\n");
        assert_eq!(metrics.errors(STEP_CONNECTION), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_counted() {
        let mut context = context(Arc::new(CaptureHandler::default()));
        context.router = MessageRouter::new(vec![], Arc::new(FailingHandler), vec![]);
        let metrics = context.metrics.clone();
        let output = converse(
            context,
            "HELO c\r\nMAIL FROM:<s@test.org>\r\nRCPT TO:<a@example.com>\r\nDATA\r\nhi\r\n.\r\nQUIT\r\n",
        )
        .await;

        assert!(output.contains("554 Transaction failed\r\n"));
        assert_eq!(metrics.errors(STEP_DELIVERY), 1);
    }

    #[tokio::test]
    async fn test_serve_metrics() {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        metrics.error(STEP_AUTH);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(serve_metrics(listener, metrics));

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();

        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("errors{step=\"auth\"} 1"));
    }
}
