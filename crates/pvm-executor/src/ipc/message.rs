//! Message kinds and payload schemas of the sandbox channel.

use crate::{
    ipc::{ByteReader, ByteWriter, DecodeError, IpcError},
    ExecutionMode, ExitReason, Gas, Invocation, Registers, VmExecutionResult,
};

/// The kind of a framed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Controller asks the sandbox to run a program.
    ExecuteRequest = 1,
    /// Sandbox reports the outcome of a run.
    ExecuteResponse = 2,
    /// Either side reports a failure.
    Error = 3,
    /// Liveness check, echoed back by the sandbox.
    Heartbeat = 4,
    /// Reserved for forwarding host calls to the controller.
    HostCallRequest = 5,
    /// Reserved answer to [`MessageType::HostCallRequest`].
    HostCallResponse = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            1 => Self::ExecuteRequest,
            2 => Self::ExecuteResponse,
            3 => Self::Error,
            4 => Self::Heartbeat,
            5 => Self::HostCallRequest,
            6 => Self::HostCallResponse,
            other => return Err(other),
        })
    }
}

/// One framed unit on the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcMessage {
    /// What the message carries.
    pub message_type: MessageType,
    /// Correlates a response with its request. Allocated per channel by the controller.
    pub request_id: u32,
    /// The encoded payload, if any.
    pub payload: Option<Vec<u8>>,
}

impl IpcMessage {
    /// Wraps a typed payload.
    pub fn new<P: Payload>(request_id: u32, payload: &P) -> Self {
        Self { message_type: P::TYPE, request_id, payload: Some(payload.encode()) }
    }

    /// Decodes the payload as `P`.
    pub fn decode_payload<P: Payload>(&self) -> Result<P, IpcError> {
        if self.message_type != P::TYPE {
            return Err(IpcError::UnexpectedMessage(self.message_type));
        }
        let payload = self.payload.as_deref().ok_or(IpcError::MissingPayload(P::TYPE))?;
        Ok(P::decode(payload)?)
    }
}

/// A typed message payload.
pub trait Payload: Sized {
    /// The message kind carrying this payload.
    const TYPE: MessageType;

    /// Writes the payload fields.
    fn write(&self, writer: &mut ByteWriter);

    /// Reads the payload fields.
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError>;

    /// Encodes the payload.
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.write(&mut writer);
        writer.finish()
    }

    /// Decodes a payload, rejecting trailing bytes.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        let payload = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(payload)
    }
}

/// Asks the sandbox to run one program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// The encoded program.
    pub blob: Vec<u8>,
    /// The code offset to start at.
    pub pc: u32,
    /// The gas budget.
    pub gas: u64,
    /// Bytes mapped into the argument region.
    pub argument_data: Option<Vec<u8>>,
    /// The caller's execution mode.
    pub mode: ExecutionMode,
}

impl ExecuteRequest {
    /// Copies `invocation` into a request carrying `mode`.
    pub fn new(invocation: Invocation<'_>, mode: ExecutionMode) -> Self {
        Self {
            blob: invocation.blob.to_vec(),
            pc: invocation.pc,
            gas: invocation.gas.get(),
            argument_data: invocation.argument_data.map(<[u8]>::to_vec),
            mode,
        }
    }

    /// The invocation this request describes.
    pub fn invocation(&self) -> Invocation<'_> {
        Invocation {
            blob: &self.blob,
            pc: self.pc,
            gas: Gas::new(self.gas),
            argument_data: self.argument_data.as_deref(),
        }
    }
}

impl Payload for ExecuteRequest {
    const TYPE: MessageType = MessageType::ExecuteRequest;

    fn write(&self, writer: &mut ByteWriter) {
        writer
            .put_bytes(&self.blob)
            .put_u32(self.pc)
            .put_u64(self.gas)
            .put_opt_bytes(self.argument_data.as_deref())
            .put_u8(self.mode.raw());
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            blob: reader.bytes()?,
            pc: reader.u32()?,
            gas: reader.u64()?,
            argument_data: reader.opt_bytes()?,
            mode: ExecutionMode::from_bits_truncate(reader.u8()?),
        })
    }
}

/// The outcome of one run inside the sandbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteResponse {
    /// [`ExitReason::to_code`] of the run.
    pub exit_reason_code: u64,
    /// Gas consumed by the run.
    pub gas_used: u64,
    /// Output bytes, if the program produced any.
    pub output_data: Option<Vec<u8>>,
    /// Set when the sandbox could not run the program at all.
    pub error_message: Option<String>,
    /// Registers when the program stopped.
    pub final_registers: Registers,
    /// Program counter when the program stopped.
    pub final_pc: u32,
}

impl From<VmExecutionResult> for ExecuteResponse {
    fn from(result: VmExecutionResult) -> Self {
        Self {
            exit_reason_code: result.exit_reason.to_code(),
            gas_used: result.gas_used.get(),
            output_data: result.output_data,
            error_message: None,
            final_registers: result.final_registers,
            final_pc: result.final_pc,
        }
    }
}

impl ExecuteResponse {
    /// Converts the response back into the caller-visible result.
    pub fn into_result(self) -> VmExecutionResult {
        VmExecutionResult {
            exit_reason: ExitReason::from_code(self.exit_reason_code),
            gas_used: Gas::new(self.gas_used),
            output_data: self.output_data,
            final_registers: self.final_registers,
            final_pc: self.final_pc,
        }
    }
}

impl Payload for ExecuteResponse {
    const TYPE: MessageType = MessageType::ExecuteResponse;

    fn write(&self, writer: &mut ByteWriter) {
        writer
            .put_u64(self.exit_reason_code)
            .put_u64(self.gas_used)
            .put_opt_bytes(self.output_data.as_deref())
            .put_opt_str(self.error_message.as_deref())
            .put_registers(&self.final_registers)
            .put_u32(self.final_pc);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            exit_reason_code: reader.u64()?,
            gas_used: reader.u64()?,
            output_data: reader.opt_bytes()?,
            error_message: reader.opt_string()?,
            final_registers: reader.registers()?,
            final_pc: reader.u32()?,
        })
    }
}

/// Category of an error frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[repr(u8)]
pub enum ErrorKind {
    /// A message could not be decoded.
    #[display("deserialization")]
    Deserialization = 1,
    /// The request handler failed.
    #[display("execution")]
    Execution = 2,
    /// The request violated a sandbox restriction.
    #[display("security")]
    Security = 3,
    /// Anything else.
    #[display("unknown")]
    Unknown = 4,
}

/// A failure reported over the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Category of the failure.
    pub kind: ErrorKind,
    /// Human readable description.
    pub message: String,
}

impl ErrorPayload {
    /// Creates an error payload.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl Payload for ErrorPayload {
    const TYPE: MessageType = MessageType::Error;

    fn write(&self, writer: &mut ByteWriter) {
        writer.put_u8(self.kind as u8).put_str(&self.message);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let kind = match reader.u8()? {
            1 => ErrorKind::Deserialization,
            2 => ErrorKind::Execution,
            3 => ErrorKind::Security,
            4 => ErrorKind::Unknown,
            value => return Err(DecodeError::UnknownVariant { field: "error kind", value }),
        };
        Ok(Self { kind, message: reader.string()? })
    }
}

/// State a sandbox reports in a heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Waiting for work.
    Ready = 1,
    /// Running a program.
    Busy = 2,
    /// Unable to serve requests.
    Error = 3,
}

/// A liveness check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    /// Milliseconds since the Unix epoch when the heartbeat was sent.
    pub timestamp: u64,
    /// State of the sender.
    pub status: WorkerStatus,
}

impl Heartbeat {
    /// A heartbeat stamped with the current time.
    pub fn now(status: WorkerStatus) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64);
        Self { timestamp, status }
    }
}

impl Payload for Heartbeat {
    const TYPE: MessageType = MessageType::Heartbeat;

    fn write(&self, writer: &mut ByteWriter) {
        writer.put_u64(self.timestamp).put_u8(self.status as u8);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let timestamp = reader.u64()?;
        let status = match reader.u8()? {
            1 => WorkerStatus::Ready,
            2 => WorkerStatus::Busy,
            3 => WorkerStatus::Error,
            value => return Err(DecodeError::UnknownVariant { field: "worker status", value }),
        };
        Ok(Self { timestamp, status })
    }
}

/// Reserved: a host call forwarded from the sandbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCallRequest {
    /// The `ecalli` index.
    pub call_index: u32,
    /// Registers at the host call.
    pub registers: Registers,
}

impl Payload for HostCallRequest {
    const TYPE: MessageType = MessageType::HostCallRequest;

    fn write(&self, writer: &mut ByteWriter) {
        writer.put_u32(self.call_index).put_registers(&self.registers);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { call_index: reader.u32()?, registers: reader.registers()? })
    }
}

/// Reserved: the controller's answer to a forwarded host call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCallResponse {
    /// [`ExitReason::to_code`] to stop with, or [`ExitReason::Continued`] to resume.
    pub outcome_code: u64,
    /// Registers to resume with, if the host call changed them.
    pub registers: Option<Registers>,
}

impl Payload for HostCallResponse {
    const TYPE: MessageType = MessageType::HostCallResponse;

    fn write(&self, writer: &mut ByteWriter) {
        writer.put_u64(self.outcome_code);
        match &self.registers {
            Some(registers) => writer.put_u8(1).put_registers(registers),
            None => writer.put_u8(0),
        };
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let outcome_code = reader.u64()?;
        let registers = if reader.flag()? { Some(reader.registers()?) } else { None };
        Ok(Self { outcome_code, registers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> ExecuteResponse {
        ExecuteResponse {
            exit_reason_code: ExitReason::PageFault(0x2_0000).to_code(),
            gas_used: 42,
            output_data: Some(vec![9, 8, 7]),
            error_message: None,
            final_registers: [3; 13],
            final_pc: 17,
        }
    }

    #[test]
    fn test_request_layout() {
        let request = ExecuteRequest {
            blob: vec![0xAA],
            pc: 2,
            gas: 3,
            argument_data: None,
            mode: ExecutionMode::SANDBOXED,
        };
        assert_eq!(
            request.encode(),
            vec![1, 0, 0, 0, 0xAA, 2, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 2]
        );
    }

    #[test]
    fn test_response_converts_to_result() {
        let result = sample_response().into_result();
        assert_eq!(result.exit_reason, ExitReason::PageFault(0x2_0000));
        assert_eq!(result.gas_used, Gas::new(42));
        assert_eq!(ExecuteResponse::from(result), sample_response());
    }

    #[test]
    fn test_decode_payload_checks_type() {
        let message = IpcMessage::new(1, &Heartbeat::now(WorkerStatus::Ready));
        assert!(matches!(
            message.decode_payload::<ExecuteResponse>(),
            Err(IpcError::UnexpectedMessage(MessageType::Heartbeat))
        ));

        let empty = IpcMessage { message_type: MessageType::Error, request_id: 1, payload: None };
        assert!(matches!(
            empty.decode_payload::<ErrorPayload>(),
            Err(IpcError::MissingPayload(MessageType::Error))
        ));
    }

    #[test]
    fn test_unknown_error_kind() {
        assert_eq!(
            ErrorPayload::decode(&[9, 0, 0, 0, 0]),
            Err(DecodeError::UnknownVariant { field: "error kind", value: 9 })
        );
    }

    #[test]
    fn test_trailing_payload_bytes() {
        let mut bytes = Heartbeat { timestamp: 1, status: WorkerStatus::Busy }.encode();
        bytes.push(0);
        assert_eq!(Heartbeat::decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }
}
