//! Binary codecs for the command channel.
//!
//! Requests: `[u32 prefix][str tag][tag fields]`. Responses: `[i32 status][body]`.
//! Strings are `[u32 byte len][utf-8]`, truncated by char count per
//! [`ProtocolConfig`]. Works over a [`ChannelReader`](super::mux::ChannelReader)
//! or any other AsyncRead/AsyncWrite.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    COMMAND_PREFIX, ClassBytecodes, NULL_STRING_SENTINEL, Payload, Request, Response, StackFrame,
    status, tags,
};
use crate::config::ProtocolConfig;
use crate::error::{ExecutionError, Link, ResolutionException, UserException};

/// Largest length or count accepted from the wire.
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

const PAYLOAD_EMPTY: u8 = 0;
const PAYLOAD_TEXT: u8 = 1;
const PAYLOAD_JSON: u8 = 2;

/// Encodes and decodes [`Request`]s.
#[derive(Debug, Clone, Default)]
pub struct RequestCodec {
    config: ProtocolConfig,
}

impl RequestCodec {
    pub fn new(config: ProtocolConfig) -> Self {
        Self { config }
    }
}

/// Encodes and decodes [`Response`]s.
#[derive(Debug, Clone, Default)]
pub struct ResponseCodec {
    config: ProtocolConfig,
}

impl ResponseCodec {
    pub fn new(config: ProtocolConfig) -> Self {
        Self { config }
    }
}

impl Encoder<Request> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        let mut out = WireWriter::new(dst, self.config);
        out.u32(COMMAND_PREFIX);
        out.str(request.tag())?;

        match request {
            Request::Load(classes) | Request::Redefine(classes) => out.classes(&classes)?,
            Request::Invoke {
                class_name,
                method_name,
            } => {
                out.str(&class_name)?;
                out.str(&method_name)?;
            }
            Request::VarValue {
                class_name,
                field_name,
            } => {
                out.str(&class_name)?;
                out.str(&field_name)?;
            }
            Request::AddClasspath(path) => out.str(&path)?,
            Request::Stop | Request::Close => {}
            Request::Extension { command, argument } => {
                if tags::is_builtin(&command) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("extension tag {command} collides with a built-in command"),
                    ));
                }
                out.untruncated_str(&argument.to_string())?;
            }
        }

        // Never shipped as agent logs: the agent tracing layer drops execlink::bridge.
        tracing::trace!(size_bytes = dst.len() - start, "Encoded request");
        Ok(())
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_with(src, read_request)
    }
}

impl Encoder<Response> for ResponseCodec {
    type Error = io::Error;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut out = WireWriter::new(dst, self.config);
        match response {
            Response::Success(payload) => {
                out.i32(status::SUCCESS);
                match payload {
                    Payload::Empty => out.u8(PAYLOAD_EMPTY),
                    Payload::Text(text) => {
                        out.u8(PAYLOAD_TEXT);
                        out.str(&text)?;
                    }
                    Payload::Json(value) => {
                        out.u8(PAYLOAD_JSON);
                        out.untruncated_str(&value.to_string())?;
                    }
                }
            }
            Response::Failure(error) => out.failure(&error)?,
        }
        Ok(())
    }
}

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_with(src, read_response)
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Cut `s` to at most `max` chars.
fn truncate_chars(s: &str, max: Option<usize>) -> &str {
    match max.and_then(|max| s.char_indices().nth(max)) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

struct WireWriter<'a> {
    dst: &'a mut BytesMut,
    config: ProtocolConfig,
}

impl<'a> WireWriter<'a> {
    fn new(dst: &'a mut BytesMut, config: ProtocolConfig) -> Self {
        Self { dst, config }
    }

    fn u8(&mut self, v: u8) {
        self.dst.put_u8(v);
    }

    fn u32(&mut self, v: u32) {
        self.dst.put_u32(v);
    }

    fn i32(&mut self, v: i32) {
        self.dst.put_i32(v);
    }

    fn len(&mut self, len: usize) -> io::Result<()> {
        let len = u32::try_from(len)
            .ok()
            .filter(|len| *len as usize <= MAX_FIELD_LEN)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("field of {len} too large"))
            })?;
        self.dst.put_u32(len);
        Ok(())
    }

    fn str(&mut self, s: &str) -> io::Result<()> {
        let s = truncate_chars(s, self.config.max_string_chars);
        self.untruncated_str(s)
    }

    fn untruncated_str(&mut self, s: &str) -> io::Result<()> {
        self.len(s.len())?;
        self.dst.put_slice(s.as_bytes());
        Ok(())
    }

    fn nullable_str(&mut self, s: Option<&str>) -> io::Result<()> {
        self.str(s.unwrap_or(NULL_STRING_SENTINEL))
    }

    fn classes(&mut self, classes: &[ClassBytecodes]) -> io::Result<()> {
        self.len(classes.len())?;
        for class in classes {
            self.untruncated_str(&class.name)?;
            self.len(class.bytecodes.len())?;
            self.dst.put_slice(&class.bytecodes);
        }
        Ok(())
    }

    fn stack(&mut self, frames: &[StackFrame]) -> io::Result<()> {
        self.len(frames.len())?;
        for frame in frames {
            self.str(&frame.declaring_class)?;
            self.str(&frame.method_name)?;
            self.nullable_str(frame.file_name.as_deref())?;
            self.i32(frame.line_number);
        }
        Ok(())
    }

    fn user_exception(&mut self, user: &UserException) -> io::Result<()> {
        self.i32(status::USER_EXCEPTION);
        self.nullable_str(user.message.as_deref())?;
        self.str(&user.exception_class)?;
        self.stack(&user.stack_trace)
    }

    fn resolution(&mut self, resolution: &ResolutionException) -> io::Result<()> {
        self.i32(status::CORRALLED);
        self.i32(resolution.id);
        self.stack(&resolution.stack_trace)
    }

    fn failure(&mut self, error: &ExecutionError) -> io::Result<()> {
        match error {
            ExecutionError::NotImplemented(message) => {
                self.i32(status::NOT_IMPLEMENTED);
                self.str(message)?;
            }
            ExecutionError::InternalProblem(message) => {
                self.i32(status::INTERNAL_PROBLEM);
                self.str(message)?;
            }
            ExecutionError::EngineTerminated(message) => {
                self.i32(status::TERMINATED);
                self.nullable_str(Some(message))?;
            }
            ExecutionError::Stopped => self.i32(status::STOPPED),
            ExecutionError::ClassInstall { message, installed } => {
                self.i32(status::CLASS_INSTALL_EXCEPTION);
                self.str(message)?;
                self.len(installed.len())?;
                for flag in installed {
                    self.u8(u8::from(*flag));
                }
            }
            ExecutionError::Resolution(resolution) => self.resolution(resolution)?,
            ExecutionError::User(user) if user.cause.is_none() => self.user_exception(user)?,
            ExecutionError::User(user) => {
                self.i32(status::USER_EXCEPTION_CHAINED);
                for link in user.chain() {
                    match link {
                        Link::User(user) => self.user_exception(user)?,
                        Link::Resolution(resolution) => self.resolution(resolution)?,
                        Link::Internal(message) => {
                            self.i32(status::INTERNAL_PROBLEM);
                            self.str(message)?;
                        }
                    }
                }
                self.i32(status::SUCCESS);
            }
        }
        Ok(())
    }
}

enum ReadError {
    /// More bytes needed; retry when they arrive.
    Incomplete,
    Invalid(io::Error),
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        Self::Invalid(e)
    }
}

type ReadResult<T> = Result<T, ReadError>;

/// Run `parse` over the buffered bytes; consume them only on a complete message.
fn decode_with<T>(
    src: &mut BytesMut,
    parse: fn(&mut WireReader<'_>) -> ReadResult<T>,
) -> io::Result<Option<T>> {
    if src.is_empty() {
        return Ok(None);
    }
    let mut reader = WireReader { buf: &src[..] };
    match parse(&mut reader) {
        Ok(item) => {
            let consumed = src.len() - reader.buf.len();
            src.advance(consumed);
            Ok(Some(item))
        }
        Err(ReadError::Incomplete) => Ok(None),
        Err(ReadError::Invalid(e)) => Err(e),
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn take(&mut self, n: usize) -> ReadResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(ReadError::Incomplete);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> ReadResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> ReadResult<i32> {
        Ok(self.u32()? as i32)
    }

    fn len(&mut self) -> ReadResult<usize> {
        let len = self.u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(invalid(format!("declared length {len} exceeds {MAX_FIELD_LEN}")).into());
        }
        Ok(len)
    }

    fn str(&mut self) -> ReadResult<String> {
        let len = self.len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ReadError::Invalid(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    fn nullable_str(&mut self) -> ReadResult<Option<String>> {
        let s = self.str()?;
        Ok((s != NULL_STRING_SENTINEL).then_some(s))
    }

    fn json(&mut self) -> ReadResult<serde_json::Value> {
        let text = self.str()?;
        serde_json::from_str(&text)
            .map_err(|e| ReadError::Invalid(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    fn classes(&mut self) -> ReadResult<Vec<ClassBytecodes>> {
        let count = self.len()?;
        let mut classes = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name = self.str()?;
            let len = self.len()?;
            let bytecodes = self.take(len)?.to_vec();
            classes.push(ClassBytecodes { name, bytecodes });
        }
        Ok(classes)
    }

    fn stack(&mut self) -> ReadResult<Vec<StackFrame>> {
        let count = self.len()?;
        let mut frames = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let declaring_class = self.str()?;
            let method_name = self.str()?;
            let file_name = self.nullable_str()?;
            let line_number = self.i32()?;
            frames.push(StackFrame {
                declaring_class,
                method_name,
                file_name,
                line_number,
            });
        }
        Ok(frames)
    }

    fn user_exception_body(&mut self) -> ReadResult<UserException> {
        let message = self.nullable_str()?;
        let exception_class = self.str()?;
        let stack_trace = self.stack()?;
        Ok(UserException::new(message, exception_class, stack_trace))
    }

    fn resolution_body(&mut self) -> ReadResult<ResolutionException> {
        let id = self.i32()?;
        let stack_trace = self.stack()?;
        Ok(ResolutionException::new(id, stack_trace))
    }
}

fn read_request(r: &mut WireReader<'_>) -> ReadResult<Request> {
    let prefix = r.u32()?;
    if prefix != COMMAND_PREFIX {
        return Err(invalid(format!("bad command prefix {prefix:#010x}")).into());
    }

    let tag = r.str()?;
    let request = match tag.as_str() {
        tags::LOAD => Request::Load(r.classes()?),
        tags::REDEFINE => Request::Redefine(r.classes()?),
        tags::INVOKE => Request::Invoke {
            class_name: r.str()?,
            method_name: r.str()?,
        },
        tags::VAR_VALUE => Request::VarValue {
            class_name: r.str()?,
            field_name: r.str()?,
        },
        tags::ADD_CLASSPATH => Request::AddClasspath(r.str()?),
        tags::STOP => Request::Stop,
        tags::CLOSE => Request::Close,
        _ => Request::Extension {
            argument: r.json()?,
            command: tag,
        },
    };
    Ok(request)
}

fn read_response(r: &mut WireReader<'_>) -> ReadResult<Response> {
    let code = r.i32()?;
    let error = match code {
        status::SUCCESS => {
            let payload = match r.u8()? {
                PAYLOAD_EMPTY => Payload::Empty,
                PAYLOAD_TEXT => Payload::Text(r.str()?),
                PAYLOAD_JSON => Payload::Json(r.json()?),
                other => return Err(invalid(format!("unknown payload kind {other}")).into()),
            };
            return Ok(Response::Success(payload));
        }
        status::TERMINATED => ExecutionError::EngineTerminated(
            r.nullable_str()?
                .unwrap_or_else(|| "agent terminated".to_string()),
        ),
        status::NOT_IMPLEMENTED => ExecutionError::NotImplemented(r.str()?),
        status::INTERNAL_PROBLEM => ExecutionError::InternalProblem(r.str()?),
        status::USER_EXCEPTION => ExecutionError::User(r.user_exception_body()?),
        status::CORRALLED => ExecutionError::Resolution(r.resolution_body()?),
        status::CLASS_INSTALL_EXCEPTION => {
            let message = r.str()?;
            let count = r.len()?;
            let installed = r.take(count)?.iter().map(|b| *b != 0).collect();
            ExecutionError::ClassInstall { message, installed }
        }
        status::STOPPED => ExecutionError::Stopped,
        status::USER_EXCEPTION_CHAINED => read_chain(r)?,
        other => return Err(invalid(format!("unknown response status {other}")).into()),
    };
    Ok(Response::Failure(error))
}

/// Links arrive outermost first and end with a bare SUCCESS marker.
fn read_chain(r: &mut WireReader<'_>) -> ReadResult<ExecutionError> {
    let mut links = Vec::new();
    loop {
        let link = match r.i32()? {
            status::SUCCESS => break,
            status::USER_EXCEPTION => ExecutionError::User(r.user_exception_body()?),
            status::CORRALLED => ExecutionError::Resolution(r.resolution_body()?),
            status::INTERNAL_PROBLEM => ExecutionError::InternalProblem(r.str()?),
            other => return Err(invalid(format!("status {other} inside exception chain")).into()),
        };
        links.push(link);
    }

    let mut cause: Option<ExecutionError> = None;
    for link in links.into_iter().rev() {
        cause = Some(match (link, cause) {
            (ExecutionError::User(mut user), cause) => {
                user.cause = cause.map(Box::new);
                ExecutionError::User(user)
            }
            (link, None) => link,
            (_, Some(_)) => {
                return Err(invalid("only user exceptions may carry a cause").into());
            }
        });
    }

    match cause {
        Some(outer @ ExecutionError::User(_)) => Ok(outer),
        _ => Err(invalid("exception chain must start with a user exception").into()),
    }
}
