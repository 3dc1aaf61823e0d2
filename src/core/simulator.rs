//! Virtual devices
//!
//! A [`VirtualDevice`] answers downlink frames according to response rules
//! and speaks the wire protocol over an in-memory duplex stream, so a
//! [`Transport`] and everything above it can run without hardware.
//! Rules can be built in code or loaded from a YAML/JSON script.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::core::logger::TrafficLog;
use crate::core::protocol::{checksum, encode_frame, Frame, FrameCodec, ProtocolConfig};
use crate::core::transport::Transport;

/// Buffer size of the in-memory link
pub const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Simulator errors
#[derive(Error, Debug)]
pub enum SimulatorError {
    /// Script file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML script error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON script error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A rule carries a malformed hex string
    #[error("Rule '{rule}': invalid hex '{value}'")]
    InvalidHex {
        /// Rule name
        rule: String,
        /// Offending value
        value: String,
    },
}

fn parse_hex(value: &str) -> Option<Vec<u8>> {
    let cleaned: String = value
        .split_whitespace()
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    hex::decode(cleaned).ok()
}

/// Condition on a decoded downlink frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchCondition {
    /// Model id and opcode, zero-padded to the configured widths
    Command {
        /// Model id
        model_id: u8,
        /// Opcode
        opcode: u8,
    },
    /// Payload prefix as hex; `*` or `??` matches any byte
    Payload {
        /// Pattern, e.g. `01 * ff`
        pattern: String,
    },
    /// Any frame
    Any,
    /// Every condition must match
    All {
        /// Conditions
        conditions: Vec<MatchCondition>,
    },
}

impl MatchCondition {
    /// Check a frame against this condition
    pub fn matches(&self, config: &ProtocolConfig, frame: &Frame) -> bool {
        match self {
            Self::Command { model_id, opcode } => {
                frame.header.as_ref() == config.downlink_header_for(&[*model_id], &[*opcode]).as_slice()
            }
            Self::Payload { pattern } => match_hex_pattern(frame.payload.as_bytes(), pattern),
            Self::Any => true,
            Self::All { conditions } => conditions.iter().all(|c| c.matches(config, frame)),
        }
    }

    fn validate(&self, rule: &str) -> Result<(), SimulatorError> {
        match self {
            Self::Payload { pattern } => {
                let bad = pattern
                    .split_whitespace()
                    .any(|part| part != "*" && part != "??" && u8::from_str_radix(part, 16).is_err());
                if bad {
                    return Err(SimulatorError::InvalidHex {
                        rule: rule.to_string(),
                        value: pattern.clone(),
                    });
                }
                Ok(())
            }
            Self::All { conditions } => conditions.iter().try_for_each(|c| c.validate(rule)),
            _ => Ok(()),
        }
    }
}

fn match_hex_pattern(data: &[u8], pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split_whitespace().collect();
    if data.len() < parts.len() {
        return false;
    }
    parts.iter().enumerate().all(|(i, part)| {
        *part == "*" || *part == "??" || u8::from_str_radix(part, 16).is_ok_and(|expected| data[i] == expected)
    })
}

/// What a matching rule sends back
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseAction {
    /// Uplink frame for the matched command (`uplink_code + model + opcode`)
    Reply {
        /// Payload as hex
        payload: String,
    },
    /// Status reply: little-endian 16-bit code, `0` for success
    Status {
        /// Status code
        code: u16,
    },
    /// Frame with an explicit header
    Frame {
        /// Header as hex
        header: String,
        /// Payload as hex
        payload: String,
    },
    /// Unframed bytes, e.g. diagnostic frames or line noise
    Raw {
        /// Bytes as hex
        hex: String,
    },
    /// Wait before the next action
    Delay {
        /// Milliseconds
        ms: u64,
    },
    /// Several actions in order
    Sequence {
        /// Actions
        actions: Vec<ResponseAction>,
    },
    /// Stay silent
    None,
}

impl ResponseAction {
    fn validate(&self, rule: &str) -> Result<(), SimulatorError> {
        let check = |value: &String| {
            parse_hex(value).map(|_| ()).ok_or_else(|| SimulatorError::InvalidHex {
                rule: rule.to_string(),
                value: value.clone(),
            })
        };
        match self {
            Self::Reply { payload } => check(payload),
            Self::Frame { header, payload } => check(header).and_then(|()| check(payload)),
            Self::Raw { hex } => check(hex),
            Self::Sequence { actions } => actions.iter().try_for_each(|a| a.validate(rule)),
            _ => Ok(()),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Response rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Match condition
    pub condition: MatchCondition,
    /// Response action
    pub action: ResponseAction,
    /// Priority (higher = checked first)
    #[serde(default)]
    pub priority: i32,
    /// Enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// One-shot (disable after first match)
    #[serde(default)]
    pub one_shot: bool,
    /// Match count
    #[serde(default)]
    pub match_count: u64,
}

impl ResponseRule {
    /// Rule with default priority
    pub fn new(name: &str, condition: MatchCondition, action: ResponseAction) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            condition,
            action,
            priority: 0,
            enabled: true,
            one_shot: false,
            match_count: 0,
        }
    }

    /// Answer a command with a status code
    pub fn status(name: &str, model_id: u8, opcode: u8, code: u16) -> Self {
        Self::new(
            name,
            MatchCondition::Command { model_id, opcode },
            ResponseAction::Status { code },
        )
    }

    /// Answer a command with a fixed payload
    pub fn reply(name: &str, model_id: u8, opcode: u8, payload: &[u8]) -> Self {
        Self::new(
            name,
            MatchCondition::Command { model_id, opcode },
            ResponseAction::Reply {
                payload: hex::encode(payload),
            },
        )
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Disable after the first match
    #[must_use]
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }
}

/// One step of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write bytes
    Send(Vec<u8>),
    /// Wait
    Wait(Duration),
}

/// Counters of a virtual device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Downlink frames received
    pub frames_received: u64,
    /// Frames that matched no rule
    pub unmatched: u64,
    /// Writes sent to the host
    pub writes: u64,
}

/// Scripted device speaking the wire protocol
pub struct VirtualDevice {
    name: String,
    config: Arc<ProtocolConfig>,
    rules: Vec<ResponseRule>,
    device_info: Option<Vec<u8>>,
    stats: Arc<RwLock<SimStats>>,
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("name", &self.name)
            .field("rules", &self.rules.len())
            .field("device_info", &self.device_info.as_ref().map(hex::encode))
            .finish()
    }
}

impl VirtualDevice {
    /// Device with no rules; it ignores the bootstrap call until
    /// [`with_device_info`](Self::with_device_info) is set
    pub fn new(name: &str, config: Arc<ProtocolConfig>) -> Self {
        Self {
            name: name.to_string(),
            config,
            rules: Vec::new(),
            device_info: None,
            stats: Arc::new(RwLock::new(SimStats::default())),
        }
    }

    /// Answer the bootstrap call with `info`
    #[must_use]
    pub fn with_device_info(mut self, info: &[u8]) -> Self {
        self.device_info = Some(info.to_vec());
        self
    }

    /// Add a response rule
    pub fn add_rule(&mut self, rule: ResponseRule) -> Result<(), SimulatorError> {
        rule.condition.validate(&rule.name)?;
        rule.action.validate(&rule.name)?;
        self.rules.push(rule);
        // Stable sort keeps insertion order among equal priorities
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    /// Get all rules
    pub fn rules(&self) -> &[ResponseRule] {
        &self.rules
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counters
    pub fn stats(&self) -> SimStats {
        *self.stats.read()
    }

    /// Device-info frame: reserved header, info bytes, checksum; no length field
    pub fn device_info_frame(&self, info: &[u8]) -> Vec<u8> {
        let mut frame = self.config.device_info_header();
        frame.extend_from_slice(info);
        let sum = checksum::calculate(&frame, self.config.checksum_size);
        frame.extend(sum);
        frame
    }

    /// Steps answering one downlink frame; the first enabled matching rule wins
    pub fn respond(&mut self, frame: &Frame) -> Vec<Step> {
        self.stats.write().frames_received += 1;

        let bootstrap = self.config.downlink_header_for(&[0], &[0]);
        if let Some(info) = &self.device_info {
            if frame.header.as_ref() == bootstrap.as_slice() {
                return vec![Step::Send(self.device_info_frame(info))];
            }
        }

        let config = self.config.clone();
        let Some(rule) = self
            .rules
            .iter_mut()
            .find(|rule| rule.enabled && rule.condition.matches(&config, frame))
        else {
            self.stats.write().unmatched += 1;
            tracing::debug!(device = %self.name, header = %hex::encode(&frame.header), "No rule matched");
            return Vec::new();
        };

        rule.match_count += 1;
        if rule.one_shot {
            rule.enabled = false;
        }
        tracing::trace!(device = %self.name, rule = %rule.name, "Rule matched");
        let action = rule.action.clone();
        let mut steps = Vec::new();
        self.expand(&action, frame, &mut steps);
        steps
    }

    fn expand(&self, action: &ResponseAction, frame: &Frame, steps: &mut Vec<Step>) {
        let cfg = &*self.config;
        let uplink = || {
            let mut header = frame.header.to_vec();
            if let Some(first) = header.first_mut() {
                *first = cfg.uplink_code;
            }
            header
        };
        // Hex was validated when the rule was added
        fn bytes(value: &str) -> Vec<u8> {
            parse_hex(value).unwrap_or_default()
        }

        match action {
            ResponseAction::Reply { payload } => {
                steps.push(Step::Send(encode_frame(cfg, &uplink(), &bytes(payload))));
            }
            ResponseAction::Status { code } => {
                steps.push(Step::Send(encode_frame(cfg, &uplink(), &code.to_le_bytes())));
            }
            ResponseAction::Frame { header, payload } => {
                steps.push(Step::Send(encode_frame(cfg, &bytes(header), &bytes(payload))));
            }
            ResponseAction::Raw { hex } => steps.push(Step::Send(bytes(hex))),
            ResponseAction::Delay { ms } => steps.push(Step::Wait(Duration::from_millis(*ms))),
            ResponseAction::Sequence { actions } => {
                for action in actions {
                    self.expand(action, frame, steps);
                }
            }
            ResponseAction::None => {}
        }
    }

    /// Serve `stream` on a background task
    pub fn spawn(self, stream: DuplexStream) -> SimulatorHandle {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let stats = self.stats.clone();
        let name = self.name.clone();

        let task = tokio::spawn(serve(self, stream, inject_rx, token.clone()));
        SimulatorHandle {
            name,
            inject_tx,
            stats,
            token,
            task: Some(task),
        }
    }
}

async fn serve(
    mut device: VirtualDevice,
    stream: DuplexStream,
    mut inject_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
) {
    let (read, mut write) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read, FrameCodec::new(device.config.clone()));

    let result: std::io::Result<()> = async {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(bytes) = inject_rx.recv() => {
                    write.write_all(&bytes).await?;
                    device.stats.write().writes += 1;
                }
                next = futures::StreamExt::next(&mut frames) => match next {
                    Some(Ok(frame)) => {
                        for step in device.respond(&frame) {
                            match step {
                                Step::Send(bytes) => {
                                    write.write_all(&bytes).await?;
                                    device.stats.write().writes += 1;
                                }
                                Step::Wait(delay) => tokio::time::sleep(delay).await,
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => tracing::debug!(device = %device.name, "Virtual device stopped"),
        Err(e) => tracing::warn!(device = %device.name, error = %e, "Virtual device link failed"),
    }
}

/// Handle to a running virtual device
pub struct SimulatorHandle {
    name: String,
    inject_tx: mpsc::UnboundedSender<Vec<u8>>,
    stats: Arc<RwLock<SimStats>>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send unsolicited bytes (indications, log frames)
    pub fn inject(&self, bytes: Vec<u8>) -> bool {
        self.inject_tx.send(bytes).is_ok()
    }

    /// Counters
    pub fn stats(&self) -> SimStats {
        *self.stats.read()
    }

    /// Stop serving and wait for the task
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Start `device` and return a transport connected to it
pub fn connect(device: VirtualDevice, codec: FrameCodec, traffic: TrafficLog) -> (Transport, SimulatorHandle) {
    let (host, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
    let name = format!("sim:{}", device.name());
    let handle = device.spawn(remote);
    (Transport::new(&name, host, codec, traffic), handle)
}

/// Virtual device described in a YAML or JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorScript {
    /// Device name
    pub name: String,
    /// Bootstrap answer as text
    #[serde(default)]
    pub device_info: Option<String>,
    /// Response rules
    #[serde(default)]
    pub rules: Vec<ResponseRule>,
}

impl SimulatorScript {
    /// Load a script; `.json` files are JSON, anything else YAML
    pub fn load(path: &Path) -> Result<Self, SimulatorError> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(serde_yaml::from_str(&content)?),
        }
    }

    /// Build the device
    pub fn build(self, config: Arc<ProtocolConfig>) -> Result<VirtualDevice, SimulatorError> {
        let mut device = VirtualDevice::new(&self.name, config);
        if let Some(info) = &self.device_info {
            device = device.with_device_info(info.as_bytes());
        }
        for rule in self.rules {
            device.add_rule(rule)?;
        }
        Ok(device)
    }
}

/// Device that identifies itself and acknowledges every command with status `0000`
pub fn acknowledging_device(name: &str, config: Arc<ProtocolConfig>) -> VirtualDevice {
    let mut device = VirtualDevice::new(name, config).with_device_info(name.as_bytes());
    device.rules.push(ResponseRule {
        description: Some("Acknowledge everything".to_string()),
        priority: i32::MIN,
        ..ResponseRule::new("ack_all", MatchCondition::Any, ResponseAction::Status { code: 0 })
    });
    device
}
