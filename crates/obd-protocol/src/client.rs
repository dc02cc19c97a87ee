//! OBD-II Client for ELM327 Adapters
//!
//! Owns the adapter session: opens the transport, runs the AT init
//! sequence, and exposes scan/clear/live-data operations.

use crate::config::ObdConfig;
use crate::dtc::{self, DtcCategory, DtcHeader, TroubleCode, TroubleCodeSet};
use crate::error::ObdError;
use crate::framer::CommandFramer;
use crate::pid::{now_ms, Pid, PidResponse, SensorFrame};
use crate::protocol::ObdProtocol;
use crate::response::{self, Processed};
use crate::transport::{ConnectionState, Transport};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// AT commands sent before the configured protocol selection
pub const INIT_COMMANDS: [&str; 5] = [
    crate::at::RESET,
    crate::at::ECHO_OFF,
    crate::at::SPACES_OFF,
    crate::at::HEADERS_OFF,
    crate::at::PROTOCOL_AUTO,
];

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    config: ObdConfig,
    framer: RwLock<Option<Arc<CommandFramer<TcpStream>>>>,
    /// Protocol the adapter settled on under `ATSP0`
    negotiated: RwLock<Option<ObdProtocol>>,
    state: watch::Sender<ConnectionState>,
}

impl ObdClient {
    /// Create a disconnected client
    pub fn new(config: ObdConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            framer: RwLock::new(None),
            negotiated: RwLock::new(None),
            state,
        }
    }

    pub fn config(&self) -> &ObdConfig {
        &self.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Check if client is connected
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// Watch connection state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect to the adapter and initialize it.
    ///
    /// Individual init commands are best effort; only a transport failure
    /// aborts the connect.
    pub async fn connect(&self) -> Result<(), ObdError> {
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }
        self.drop_framer().await;
        *self.negotiated.write().await = None;

        info!(host = %self.config.host, port = self.config.port, "Connecting to OBD adapter");
        self.set_state(ConnectionState::Connecting);

        let transport = match Transport::open(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout(),
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                error!("Connection failed: {}", e);
                self.set_state(ConnectionState::Failed(e.to_string()));
                return Err(e);
            }
        };

        let framer = Arc::new(CommandFramer::new(
            transport,
            self.config.response_timeout(),
        ));
        *self.framer.write().await = Some(framer.clone());
        self.set_state(ConnectionState::Ready);

        self.initialize(&framer).await?;
        info!("OBD adapter initialized successfully");
        Ok(())
    }

    async fn initialize(&self, framer: &CommandFramer<TcpStream>) -> Result<(), ObdError> {
        let protocol = self.config.protocol.to_elm_command();
        let explicit = (protocol != crate::at::PROTOCOL_AUTO).then_some(protocol);
        let commands = INIT_COMMANDS.into_iter().chain(explicit);

        for (i, command) in commands.enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.init_delay()).await;
            }
            match framer.send_and_await(command).await {
                Ok(raw) => debug!(%command, response = ?raw, "Init command done"),
                Err(e) if e.is_fatal() => {
                    error!(%command, "Adapter initialization aborted: {}", e);
                    self.fail(&e).await;
                    return Err(e);
                }
                Err(e) if e.ends_session() => {
                    info!(%command, "Adapter initialization interrupted: {}", e);
                    return Err(e);
                }
                Err(e) => warn!(%command, "Init command failed, continuing: {}", e),
            }
        }

        if self.config.detects_protocol() {
            tokio::time::sleep(self.config.init_delay()).await;
            match self.detect_protocol().await {
                Ok(_) => {}
                Err(e) if e.ends_session() => return Err(e),
                Err(e) => warn!("Protocol detection failed, continuing: {}", e),
            }
        }
        Ok(())
    }

    /// Ask the adapter which protocol it negotiated and remember it.
    ///
    /// Returns `None` while the adapter is still searching.
    async fn detect_protocol(&self) -> Result<Option<ObdProtocol>, ObdError> {
        let Some(lines) = self
            .send_command(crate::at::DESCRIBE_PROTOCOL_NUMBER)
            .await?
        else {
            return Ok(None);
        };

        let reply = response::normalize(&lines[0]);
        let detected = ObdProtocol::from_elm_number(&reply).filter(|p| *p != ObdProtocol::Auto);
        match detected {
            Some(protocol) => {
                info!(?protocol, "Adapter negotiated protocol");
                *self.negotiated.write().await = Some(protocol);
            }
            None => debug!(%reply, "Protocol not negotiated yet"),
        }
        Ok(detected)
    }

    /// Header layout used to decode DTC responses
    pub async fn dtc_header(&self) -> DtcHeader {
        match *self.negotiated.read().await {
            Some(protocol) if self.config.dtc_header.is_none() => protocol.dtc_header(),
            _ => self.config.dtc_header(),
        }
    }

    /// Send a command and return its data lines, or `None` for NO DATA
    pub async fn send_command(&self, command: &str) -> Result<Option<Vec<String>>, ObdError> {
        let framer = self
            .framer
            .read()
            .await
            .clone()
            .ok_or(ObdError::NoConnection)?;

        let raw = match framer.send_and_await(command).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.is_fatal() {
                    self.fail(&e).await;
                }
                return Err(e);
            }
        };

        match response::process(&raw) {
            Processed::Lines(lines) => Ok(Some(lines)),
            Processed::NoData => {
                debug!(%command, "No data");
                Ok(None)
            }
            Processed::AdapterError(marker) => {
                warn!(%command, %marker, "Adapter reported an error");
                Err(ObdError::AdapterError(marker))
            }
        }
    }

    /// Read the trouble codes of one category
    pub async fn scan(&self, category: DtcCategory) -> Result<Option<Vec<TroubleCode>>, ObdError> {
        let Some(lines) = self.send_command(&category.command()).await? else {
            return Ok(None);
        };

        let expected = format!("{:02X}", category.response_mode());
        if !response::normalize(&lines[0]).starts_with(&expected) {
            warn!(?category, line = %lines[0], "Unexpected mode echo in DTC response");
        }

        // The first OBD request is what makes an auto-searching adapter settle
        if self.config.detects_protocol() && self.negotiated.read().await.is_none() {
            match self.detect_protocol().await {
                Ok(_) => {}
                Err(e) if e.ends_session() => return Err(e),
                Err(e) => warn!("Protocol detection failed: {}", e),
            }
        }

        let codes = dtc::decode(&lines, self.dtc_header().await)?;
        info!(?category, count = codes.len(), "Trouble codes read");
        Ok(Some(
            codes
                .into_iter()
                .map(|code| TroubleCode::new(code, category))
                .collect(),
        ))
    }

    /// Scan pending, confirmed and permanent codes into one set
    pub async fn scan_all(&self) -> Result<TroubleCodeSet, ObdError> {
        let mut set = TroubleCodeSet::new();
        for category in DtcCategory::ALL {
            for code in self.scan(category).await?.unwrap_or_default() {
                set.upsert(code.code(), category);
            }
        }
        Ok(set)
    }

    /// Clear stored trouble codes; true only if the adapter acknowledged with `44`
    pub async fn clear(&self) -> Result<bool, ObdError> {
        let command = format!("{:02X}", crate::mode::CLEAR_DTC);
        let lines = match self.send_command(&command).await {
            Ok(Some(lines)) => lines,
            Ok(None) | Err(ObdError::AdapterError(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let ack = format!("{:02X}", crate::mode::CLEAR_DTC + crate::mode::RESPONSE_OFFSET);
        let cleared = lines.iter().any(|line| {
            response::normalize(line)
                .as_bytes()
                .chunks(2)
                .any(|token| token == ack.as_bytes())
        });

        if cleared {
            info!("Trouble codes cleared");
        } else {
            warn!(?lines, "Clear not acknowledged");
        }
        Ok(cleared)
    }

    /// Query a live-data PID
    pub async fn query_pid(&self, pid: Pid) -> Result<Option<PidResponse>, ObdError> {
        debug!("Querying PID {:02X}", pid.as_hex());
        match self.send_command(&pid.command()).await? {
            Some(lines) => {
                let response = PidResponse::parse(pid, &lines, now_ms())?;
                debug!(
                    ?pid,
                    value = response.value,
                    unit = pid.unit(),
                    "PID decoded"
                );
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    /// Query RPM, speed and coolant temperature into one frame
    pub async fn read_sensor_frame(&self) -> Result<SensorFrame, ObdError> {
        let mut frame = SensorFrame::new(now_ms());
        for pid in Pid::ALL {
            if let Some(response) = self.query_pid(pid).await? {
                frame.update_from_response(&response);
            }
        }
        Ok(frame)
    }

    /// Disconnect from the OBD adapter
    pub async fn disconnect(&self) {
        if self.drop_framer().await {
            info!("Disconnecting OBD client");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close and forget the current framer; true if one existed
    async fn drop_framer(&self) -> bool {
        let framer = self.framer.write().await.take();
        match framer {
            Some(framer) => {
                framer.close().await;
                true
            }
            None => false,
        }
    }

    async fn fail(&self, err: &ObdError) {
        self.drop_framer().await;
        self.set_state(ConnectionState::Failed(err.to_string()));
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            info!(?state, "Connection state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// In-process ELM327 stand-in. Replies from a command table, echoes `OK`
    /// for unknown AT commands, and reports every received command.
    /// `|` separates successive replies to one command; the last one repeats.
    struct FakeAdapter {
        port: u16,
        commands: mpsc::UnboundedReceiver<String>,
    }

    impl FakeAdapter {
        async fn start(replies: &[(&str, &str)]) -> Self {
            let mut replies: HashMap<String, VecDeque<String>> = replies
                .iter()
                .map(|(k, v)| (k.to_string(), v.split('|').map(str::to_string).collect()))
                .collect();
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (tx, commands) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut line = Vec::new();
                let mut byte = [0u8; 1];
                while socket.read_exact(&mut byte).await.is_ok() {
                    if byte[0] != b'\r' {
                        line.push(byte[0]);
                        continue;
                    }
                    let command = String::from_utf8(std::mem::take(&mut line)).unwrap();
                    let _ = tx.send(command.clone());
                    let scripted = replies.get_mut(&command).and_then(|queue| {
                        if queue.len() > 1 {
                            queue.pop_front()
                        } else {
                            queue.front().cloned()
                        }
                    });
                    let reply = match scripted {
                        Some(reply) if reply == "<close>" => return,
                        Some(reply) if reply == "<silent>" => continue,
                        Some(reply) => reply.clone(),
                        None if command.starts_with("AT") => "OK".to_string(),
                        None => "?".to_string(),
                    };
                    let framed = format!("{}\r\r>", reply);
                    if socket.write_all(framed.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });

            Self { port, commands }
        }

        fn config(&self) -> ObdConfig {
            ObdConfig {
                init_delay_ms: 0,
                response_timeout_ms: Some(500),
                ..ObdConfig::new("127.0.0.1", self.port)
            }
        }

        async fn client(&self, config: Option<ObdConfig>) -> ObdClient {
            let client = ObdClient::new(config.unwrap_or_else(|| self.config()));
            client.connect().await.unwrap();
            client
        }

        fn drain(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(command) = self.commands.try_recv() {
                out.push(command);
            }
            out
        }
    }

    #[tokio::test]
    async fn test_connect_runs_init_sequence() {
        let mut adapter = FakeAdapter::start(&[("ATZ", "ELM327 v1.5")]).await;
        let client = adapter.client(None).await;

        assert!(client.is_connected());
        assert_eq!(
            adapter.drain(),
            vec!["ATZ", "ATE0", "ATS0", "ATH0", "ATSP0", "ATSP3"]
        );
    }

    #[tokio::test]
    async fn test_init_is_best_effort() {
        let mut adapter = FakeAdapter::start(&[("ATS0", "?"), ("ATH0", "<silent>")]).await;
        let config = ObdConfig {
            response_timeout_ms: Some(50),
            ..adapter.config()
        };
        let client = adapter.client(Some(config)).await;

        assert!(client.is_connected());
        assert_eq!(adapter.drain().len(), 6);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ObdClient::new(ObdConfig::new("127.0.0.1", port));
        let result = client.connect().await;
        assert!(matches!(result, Err(ObdError::Transport(_))));
        assert!(matches!(client.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_adapter_closing_during_init_aborts() {
        let adapter = FakeAdapter::start(&[("ATE0", "<close>")]).await;
        let client = ObdClient::new(adapter.config());
        let result = client.connect().await;
        assert!(result.unwrap_err().is_fatal());
        assert!(matches!(client.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_command_without_connection() {
        let client = ObdClient::new(ObdConfig::default());
        assert_eq!(client.send_command("03").await, Err(ObdError::NoConnection));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_scan_confirmed_can() {
        let adapter = FakeAdapter::start(&[("03", "43 02 01 33 00 00")]).await;
        let config = ObdConfig {
            protocol: crate::ObdProtocol::Iso15765_4Can11bit500,
            ..adapter.config()
        };
        let client = adapter.client(Some(config)).await;

        let codes = client.scan(DtcCategory::Confirmed).await.unwrap().unwrap();
        assert_eq!(codes, vec![TroubleCode::new("P0133", DtcCategory::Confirmed)]);
    }

    #[tokio::test]
    async fn test_scan_no_data_is_none() {
        let adapter = FakeAdapter::start(&[("07", "NO DATA")]).await;
        let client = adapter.client(None).await;
        assert_eq!(client.scan(DtcCategory::Pending).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_malformed_payload() {
        let adapter = FakeAdapter::start(&[("0A", "4A 01 3X")]).await;
        let client = adapter.client(None).await;
        assert!(matches!(
            client.scan(DtcCategory::Permanent).await,
            Err(ObdError::MalformedPayload(_))
        ));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_scan_all_last_category_wins() {
        let adapter = FakeAdapter::start(&[
            ("07", "47 04 20 01 33"),
            ("03", "43 04 20 00 00"),
            ("0A", "NO DATA"),
        ])
        .await;
        let client = adapter.client(None).await;

        let set = client.scan_all().await.unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("P0420").unwrap().category, DtcCategory::Confirmed);
        assert_eq!(set.get("P0133").unwrap().category, DtcCategory::Pending);
    }

    #[tokio::test]
    async fn test_clear_acknowledged() {
        let adapter = FakeAdapter::start(&[("04", "44")]).await;
        let client = adapter.client(None).await;
        assert!(client.clear().await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_not_acknowledged() {
        let adapter = FakeAdapter::start(&[("04", "NO DATA")]).await;
        let client = adapter.client(None).await;
        assert!(!client.clear().await.unwrap());

        let adapter = FakeAdapter::start(&[("04", "7F 04 22")]).await;
        let client = adapter.client(None).await;
        assert!(!client.clear().await.unwrap());

        let adapter = FakeAdapter::start(&[("04", "?")]).await;
        let client = adapter.client(None).await;
        assert!(!client.clear().await.unwrap());
    }

    #[tokio::test]
    async fn test_adapter_error_marker() {
        let adapter = FakeAdapter::start(&[("03", "UNABLE TO CONNECT")]).await;
        let client = adapter.client(None).await;
        assert_eq!(
            client.send_command("03").await,
            Err(ObdError::AdapterError("UNABLE TO CONNECT".to_string()))
        );
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_read_sensor_frame() {
        let adapter = FakeAdapter::start(&[
            ("010C", "41 0C 1A F8"),
            ("010D", "41 0D 32"),
            ("0105", "NO DATA"),
        ])
        .await;
        let client = adapter.client(None).await;

        let frame = client.read_sensor_frame().await.unwrap();
        assert_eq!(frame.rpm, Some(1726));
        assert_eq!(frame.speed, Some(50));
        assert_eq!(frame.coolant_temp, None);
    }

    #[tokio::test]
    async fn test_concurrent_command_is_busy() {
        let adapter = FakeAdapter::start(&[("03", "<silent>")]).await;
        let config = ObdConfig {
            response_timeout_ms: None,
            ..adapter.config()
        };
        let client = Arc::new(adapter.client(Some(config)).await);

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.send_command("03").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.send_command("07").await, Err(ObdError::ProtocolBusy));

        client.disconnect().await;
        assert_eq!(pending.await.unwrap(), Err(ObdError::Cancelled));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_response_timeout_keeps_session() {
        let adapter = FakeAdapter::start(&[("03", "<silent>"), ("04", "44")]).await;
        let config = ObdConfig {
            response_timeout_ms: Some(50),
            ..adapter.config()
        };
        let client = adapter.client(Some(config)).await;

        assert_eq!(
            client.send_command("03").await,
            Err(ObdError::ResponseTimeout(50))
        );
        assert!(client.is_connected());
        assert!(client.clear().await.unwrap());
    }

    #[tokio::test]
    async fn test_state_subscription() {
        let adapter = FakeAdapter::start(&[]).await;
        let client = ObdClient::new(adapter.config());
        let mut states = client.subscribe();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

        client.connect().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Ready);

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_failure_fails_session() {
        let adapter = FakeAdapter::start(&[]).await;
        let client = adapter.client(None).await;

        let framer = client.framer.read().await.clone().unwrap();
        framer.shutdown_write().await.unwrap();

        let err = client.send_command("03").await.unwrap_err();
        assert!(matches!(err, ObdError::Transport(_)));
        assert!(matches!(client.state(), ConnectionState::Failed(_)));
        assert_eq!(client.send_command("03").await, Err(ObdError::NoConnection));
    }

    #[tokio::test]
    async fn test_auto_protocol_detects_can_header() {
        let mut adapter =
            FakeAdapter::start(&[("ATDPN", "A6"), ("03", "43 01 01 33")]).await;
        let config = ObdConfig {
            protocol: crate::ObdProtocol::Auto,
            ..adapter.config()
        };
        let client = adapter.client(Some(config)).await;
        assert_eq!(
            adapter.drain(),
            vec!["ATZ", "ATE0", "ATS0", "ATH0", "ATSP0", "ATDPN"]
        );
        assert_eq!(client.dtc_header().await, DtcHeader::ModeAndCount);

        let codes = client.scan(DtcCategory::Confirmed).await.unwrap().unwrap();
        assert_eq!(codes, vec![TroubleCode::new("P0133", DtcCategory::Confirmed)]);
        assert_eq!(adapter.drain(), vec!["03"]);
    }

    #[tokio::test]
    async fn test_auto_protocol_detected_after_first_request() {
        let mut adapter = FakeAdapter::start(&[
            ("ATDPN", "A0|A6"),
            ("07", "47 02 01 33 04 20"),
        ])
        .await;
        let config = ObdConfig {
            protocol: crate::ObdProtocol::Auto,
            ..adapter.config()
        };
        let client = adapter.client(Some(config)).await;
        assert_eq!(client.dtc_header().await, DtcHeader::ModeOnly);
        adapter.drain();

        let codes = client.scan(DtcCategory::Pending).await.unwrap().unwrap();
        let codes: Vec<&str> = codes.iter().map(TroubleCode::code).collect();
        assert_eq!(codes, vec!["P0133", "P0420"]);
        assert_eq!(adapter.drain(), vec!["07", "ATDPN"]);
    }

    #[tokio::test]
    async fn test_explicit_header_skips_detection() {
        let mut adapter = FakeAdapter::start(&[("ATDPN", "A6")]).await;
        let config = ObdConfig {
            protocol: crate::ObdProtocol::Auto,
            dtc_header: Some(DtcHeader::ModeOnly),
            ..adapter.config()
        };
        let client = adapter.client(Some(config)).await;
        assert!(!adapter.drain().contains(&"ATDPN".to_string()));
        assert_eq!(client.dtc_header().await, DtcHeader::ModeOnly);
    }

    #[tokio::test]
    async fn test_disconnect_during_init_aborts_connect() {
        let mut adapter = FakeAdapter::start(&[("ATE0", "<silent>")]).await;
        let config = ObdConfig {
            response_timeout_ms: None,
            ..adapter.config()
        };
        let client = Arc::new(ObdClient::new(config));

        let connecting = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        while adapter.commands.recv().await.as_deref() != Some("ATE0") {}

        client.disconnect().await;
        assert_eq!(connecting.await.unwrap(), Err(ObdError::Cancelled));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(adapter.drain().is_empty());
    }
}
