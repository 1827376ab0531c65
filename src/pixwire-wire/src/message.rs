//! Message framing: a `u32` type tag followed by a type-specific payload.

use crate::error::{ProtocolError, WireError};
use crate::param::{
    get_i32, get_string, get_u32, get_u8, put_float, put_i32, put_string, put_u32, read_params,
    write_params, Param, ParamDef, ParamList, ParamType, WireRead, MAX_PARAMS,
};
use crate::transport::{ChannelReader, Transport};
use serde::{Deserialize, Serialize};

/// Protocol revision exchanged in the `Config` handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Largest tile payload accepted from the wire.
pub const MAX_TILE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Reserved tag; nothing is registered for it.
    Error = 0,
    Quit,
    Config,
    TileReq,
    TileAck,
    TileData,
    ProcRun,
    ProcReturn,
    TempProcRun,
    TempProcReturn,
    ProcInstall,
    ProcUninstall,
    ExtensionAck,
}

impl MessageType {
    /// Maps a wire tag to a message type with a registered codec.
    pub fn from_wire(tag: u32) -> Result<Self, ProtocolError> {
        let kind = match tag {
            1 => MessageType::Quit,
            2 => MessageType::Config,
            3 => MessageType::TileReq,
            4 => MessageType::TileAck,
            5 => MessageType::TileData,
            6 => MessageType::ProcRun,
            7 => MessageType::ProcReturn,
            8 => MessageType::TempProcRun,
            9 => MessageType::TempProcReturn,
            10 => MessageType::ProcInstall,
            11 => MessageType::ProcUninstall,
            12 => MessageType::ExtensionAck,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(kind)
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Error => "GP_ERROR",
            MessageType::Quit => "GP_QUIT",
            MessageType::Config => "GP_CONFIG",
            MessageType::TileReq => "GP_TILE_REQ",
            MessageType::TileAck => "GP_TILE_ACK",
            MessageType::TileData => "GP_TILE_DATA",
            MessageType::ProcRun => "GP_PROC_RUN",
            MessageType::ProcReturn => "GP_PROC_RETURN",
            MessageType::TempProcRun => "GP_TEMP_PROC_RUN",
            MessageType::TempProcReturn => "GP_TEMP_PROC_RETURN",
            MessageType::ProcInstall => "GP_PROC_INSTALL",
            MessageType::ProcUninstall => "GP_PROC_UNINSTALL",
            MessageType::ExtensionAck => "GP_EXTENSION_ACK",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a procedure as it travels in `ProcInstall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ProcKind {
    Internal = 0,
    Plugin = 1,
    Extension = 2,
    Temporary = 3,
}

impl ProcKind {
    pub fn from_wire(tag: u32) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(ProcKind::Internal),
            1 => Ok(ProcKind::Plugin),
            2 => Ok(ProcKind::Extension),
            3 => Ok(ProcKind::Temporary),
            other => Err(ProtocolError::InvalidProcKind(other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Host settings pushed to a plug-in before its first procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub version: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Shared memory segment for tile transfer, or -1 when tiles go inline.
    pub shm_id: i32,
    pub gamma: f64,
    pub install_cmap: bool,
    pub use_xshm: bool,
    pub color_cube: [u8; 4],
}

impl Config {
    pub fn new(tile_width: u32, tile_height: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            tile_width,
            tile_height,
            shm_id: -1,
            gamma: 1.0,
            install_cmap: false,
            use_xshm: false,
            color_cube: [6, 6, 4, 24],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileReq {
    pub drawable_id: i32,
    pub tile_num: u32,
    pub shadow: bool,
}

impl TileReq {
    /// Drawable id announcing that the plug-in is about to push a tile.
    pub const PUT_SENTINEL: i32 = -1;

    pub fn put() -> Self {
        Self {
            drawable_id: Self::PUT_SENTINEL,
            tile_num: 0,
            shadow: false,
        }
    }

    pub fn is_put(&self) -> bool {
        self.drawable_id == Self::PUT_SENTINEL
    }
}

/// Everything in a `TileData` message except the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileHeader {
    pub drawable_id: i32,
    pub tile_num: u32,
    pub shadow: bool,
    pub bpp: u32,
    pub width: u32,
    pub height: u32,
    pub use_shm: bool,
}

impl TileHeader {
    pub fn data_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bpp as usize
    }

    /// Pixels follow the header only when they are not in shared memory.
    pub fn carries_data(&self) -> bool {
        !self.use_shm && self.data_len() > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileData {
    pub header: TileHeader,
    pub data: Vec<u8>,
}

/// Name and parameters of a procedure call or its return.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcCall {
    pub name: String,
    pub params: Vec<Param>,
}

impl ProcCall {
    pub fn new(name: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn view(&self) -> ProcCallRef<'_> {
        ProcCallRef {
            name: &self.name,
            params: ParamList::Owned(&self.params),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcCallRef<'a> {
    pub name: &'a str,
    pub params: ParamList<'a>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcInstall {
    pub name: String,
    pub blurb: String,
    pub help: String,
    pub author: String,
    pub copyright: String,
    pub date: String,
    pub menu_path: Option<String>,
    pub image_types: Option<String>,
    pub kind: ProcKind,
    pub params: Vec<ParamDef>,
    pub returns: Vec<ParamDef>,
}

impl ProcInstall {
    pub fn new(name: impl Into<String>, kind: ProcKind) -> Self {
        Self {
            name: name.into(),
            blurb: String::new(),
            help: String::new(),
            author: String::new(),
            copyright: String::new(),
            date: String::new(),
            menu_path: None,
            image_types: None,
            kind,
            params: Vec::new(),
            returns: Vec::new(),
        }
    }
}

/// A decoded message; dropping it releases every buffer it owns.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Quit,
    Config(Config),
    TileReq(TileReq),
    TileAck,
    TileData(TileData),
    ProcRun(ProcCall),
    ProcReturn(ProcCall),
    TempProcRun(ProcCall),
    TempProcReturn(ProcCall),
    ProcInstall(ProcInstall),
    ProcUninstall(String),
    ExtensionAck,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Quit => MessageType::Quit,
            Message::Config(_) => MessageType::Config,
            Message::TileReq(_) => MessageType::TileReq,
            Message::TileAck => MessageType::TileAck,
            Message::TileData(_) => MessageType::TileData,
            Message::ProcRun(_) => MessageType::ProcRun,
            Message::ProcReturn(_) => MessageType::ProcReturn,
            Message::TempProcRun(_) => MessageType::TempProcRun,
            Message::TempProcReturn(_) => MessageType::TempProcReturn,
            Message::ProcInstall(_) => MessageType::ProcInstall,
            Message::ProcUninstall(_) => MessageType::ProcUninstall,
            Message::ExtensionAck => MessageType::ExtensionAck,
        }
    }

    pub fn view(&self) -> MessageRef<'_> {
        match self {
            Message::Quit => MessageRef::Quit,
            Message::Config(config) => MessageRef::Config(config),
            Message::TileReq(req) => MessageRef::TileReq(*req),
            Message::TileAck => MessageRef::TileAck,
            Message::TileData(tile) => MessageRef::TileData {
                header: tile.header,
                data: &tile.data,
            },
            Message::ProcRun(call) => MessageRef::ProcRun(call.view()),
            Message::ProcReturn(call) => MessageRef::ProcReturn(call.view()),
            Message::TempProcRun(call) => MessageRef::TempProcRun(call.view()),
            Message::TempProcReturn(call) => MessageRef::TempProcReturn(call.view()),
            Message::ProcInstall(install) => MessageRef::ProcInstall(install),
            Message::ProcUninstall(name) => MessageRef::ProcUninstall(name),
            Message::ExtensionAck => MessageRef::ExtensionAck,
        }
    }
}

/// An outgoing message whose payload is borrowed from the sender.
#[derive(Debug, Clone, Copy)]
pub enum MessageRef<'a> {
    Quit,
    Config(&'a Config),
    TileReq(TileReq),
    TileAck,
    TileData { header: TileHeader, data: &'a [u8] },
    ProcRun(ProcCallRef<'a>),
    ProcReturn(ProcCallRef<'a>),
    TempProcRun(ProcCallRef<'a>),
    TempProcReturn(ProcCallRef<'a>),
    ProcInstall(&'a ProcInstall),
    ProcUninstall(&'a str),
    ExtensionAck,
}

impl MessageRef<'_> {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageRef::Quit => MessageType::Quit,
            MessageRef::Config(_) => MessageType::Config,
            MessageRef::TileReq(_) => MessageType::TileReq,
            MessageRef::TileAck => MessageType::TileAck,
            MessageRef::TileData { .. } => MessageType::TileData,
            MessageRef::ProcRun(_) => MessageType::ProcRun,
            MessageRef::ProcReturn(_) => MessageType::ProcReturn,
            MessageRef::TempProcRun(_) => MessageType::TempProcRun,
            MessageRef::TempProcReturn(_) => MessageType::TempProcReturn,
            MessageRef::ProcInstall(_) => MessageType::ProcInstall,
            MessageRef::ProcUninstall(_) => MessageType::ProcUninstall,
            MessageRef::ExtensionAck => MessageType::ExtensionAck,
        }
    }
}

fn put_bool(buf: &mut Vec<u8>, value: bool) {
    put_u32(buf, u32::from(value));
}

fn put_count(buf: &mut Vec<u8>, what: &'static str, len: usize) -> Result<(), ProtocolError> {
    if len > MAX_PARAMS {
        return Err(ProtocolError::Oversized {
            what,
            len,
            max: MAX_PARAMS,
        });
    }
    put_u32(buf, len as u32);
    Ok(())
}

fn put_call(buf: &mut Vec<u8>, call: &ProcCallRef<'_>) -> Result<(), ProtocolError> {
    put_string(buf, Some(call.name))?;
    put_count(buf, "parameter count", call.params.len())?;
    write_params(buf, call.params)
}

fn put_defs(buf: &mut Vec<u8>, defs: &[ParamDef]) -> Result<(), ProtocolError> {
    put_count(buf, "parameter definitions", defs.len())?;
    for def in defs {
        put_u32(buf, def.kind.to_wire());
        put_string(buf, Some(def.name.as_str()))?;
        put_string(buf, Some(def.description.as_str()))?;
    }
    Ok(())
}

/// Encodes one complete message, type tag first.
pub fn encode_message(message: &MessageRef<'_>) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    put_u32(&mut buf, message.message_type().to_wire());
    match message {
        MessageRef::Quit | MessageRef::TileAck | MessageRef::ExtensionAck => {}
        MessageRef::Config(config) => {
            put_u32(&mut buf, config.version);
            put_u32(&mut buf, config.tile_width);
            put_u32(&mut buf, config.tile_height);
            put_i32(&mut buf, config.shm_id);
            put_float(&mut buf, config.gamma)?;
            buf.push(u8::from(config.install_cmap));
            buf.push(u8::from(config.use_xshm));
            buf.extend_from_slice(&config.color_cube);
        }
        MessageRef::TileReq(req) => {
            put_i32(&mut buf, req.drawable_id);
            put_u32(&mut buf, req.tile_num);
            put_bool(&mut buf, req.shadow);
        }
        MessageRef::TileData { header, data } => {
            let expected = if header.carries_data() {
                header.data_len()
            } else {
                0
            };
            if data.len() != expected {
                return Err(ProtocolError::TileSizeMismatch {
                    expected,
                    actual: data.len(),
                });
            }
            put_i32(&mut buf, header.drawable_id);
            put_u32(&mut buf, header.tile_num);
            put_bool(&mut buf, header.shadow);
            put_u32(&mut buf, header.bpp);
            put_u32(&mut buf, header.width);
            put_u32(&mut buf, header.height);
            put_bool(&mut buf, header.use_shm);
            buf.extend_from_slice(data);
        }
        MessageRef::ProcRun(call)
        | MessageRef::ProcReturn(call)
        | MessageRef::TempProcRun(call)
        | MessageRef::TempProcReturn(call) => put_call(&mut buf, call)?,
        MessageRef::ProcInstall(install) => {
            for text in [
                &install.name,
                &install.blurb,
                &install.help,
                &install.author,
                &install.copyright,
                &install.date,
            ] {
                put_string(&mut buf, Some(text.as_str()))?;
            }
            put_string(&mut buf, install.menu_path.as_deref())?;
            put_string(&mut buf, install.image_types.as_deref())?;
            put_u32(&mut buf, install.kind.to_wire());
            put_defs(&mut buf, &install.params)?;
            put_defs(&mut buf, &install.returns)?;
        }
        MessageRef::ProcUninstall(name) => put_string(&mut buf, Some(*name))?,
    }
    Ok(buf)
}

fn get_bool<R: WireRead + ?Sized>(r: &mut R) -> Result<bool, WireError> {
    Ok(get_u32(r)? != 0)
}

fn get_count<R: WireRead + ?Sized>(r: &mut R, what: &'static str) -> Result<u32, WireError> {
    let count = get_u32(r)?;
    if count as usize > MAX_PARAMS {
        return Err(ProtocolError::Oversized {
            what,
            len: count as usize,
            max: MAX_PARAMS,
        }
        .into());
    }
    Ok(count)
}

fn get_call<R: WireRead + ?Sized>(r: &mut R) -> Result<ProcCall, WireError> {
    let name = get_string(r)?.unwrap_or_default();
    let count = get_count(r, "parameter count")?;
    let params = read_params(r, count)?;
    Ok(ProcCall { name, params })
}

fn get_defs<R: WireRead + ?Sized>(r: &mut R) -> Result<Vec<ParamDef>, WireError> {
    let count = get_count(r, "parameter definitions")?;
    let mut defs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = ParamType::from_wire(get_u32(r)?)?;
        let name = get_string(r)?.unwrap_or_default();
        let description = get_string(r)?.unwrap_or_default();
        defs.push(ParamDef {
            kind,
            name,
            description,
        });
    }
    Ok(defs)
}

/// Decodes one complete message from `r`.
pub fn decode_message<R: WireRead + ?Sized>(r: &mut R) -> Result<Message, WireError> {
    let kind = MessageType::from_wire(get_u32(r)?)?;
    let message = match kind {
        MessageType::Error => return Err(ProtocolError::UnknownMessageType(0).into()),
        MessageType::Quit => Message::Quit,
        MessageType::TileAck => Message::TileAck,
        MessageType::ExtensionAck => Message::ExtensionAck,
        MessageType::Config => {
            let version = get_u32(r)?;
            let tile_width = get_u32(r)?;
            let tile_height = get_u32(r)?;
            let shm_id = get_i32(r)?;
            let gamma = crate::param::get_float(r)?;
            let install_cmap = get_u8(r)? != 0;
            let use_xshm = get_u8(r)? != 0;
            let mut color_cube = [0u8; 4];
            r.read_exact_bytes(&mut color_cube)?;
            Message::Config(Config {
                version,
                tile_width,
                tile_height,
                shm_id,
                gamma,
                install_cmap,
                use_xshm,
                color_cube,
            })
        }
        MessageType::TileReq => Message::TileReq(TileReq {
            drawable_id: get_i32(r)?,
            tile_num: get_u32(r)?,
            shadow: get_bool(r)?,
        }),
        MessageType::TileData => {
            let header = TileHeader {
                drawable_id: get_i32(r)?,
                tile_num: get_u32(r)?,
                shadow: get_bool(r)?,
                bpp: get_u32(r)?,
                width: get_u32(r)?,
                height: get_u32(r)?,
                use_shm: get_bool(r)?,
            };
            let data = if header.carries_data() {
                let len = header.data_len();
                if len > MAX_TILE_BYTES {
                    return Err(ProtocolError::Oversized {
                        what: "tile data",
                        len,
                        max: MAX_TILE_BYTES,
                    }
                    .into());
                }
                let mut data = vec![0u8; len];
                r.read_exact_bytes(&mut data)?;
                data
            } else {
                Vec::new()
            };
            Message::TileData(TileData { header, data })
        }
        MessageType::ProcRun => Message::ProcRun(get_call(r)?),
        MessageType::ProcReturn => Message::ProcReturn(get_call(r)?),
        MessageType::TempProcRun => Message::TempProcRun(get_call(r)?),
        MessageType::TempProcReturn => Message::TempProcReturn(get_call(r)?),
        MessageType::ProcInstall => {
            let mut text = Vec::with_capacity(6);
            for _ in 0..6 {
                text.push(get_string(r)?.unwrap_or_default());
            }
            let menu_path = get_string(r)?;
            let image_types = get_string(r)?;
            let kind = ProcKind::from_wire(get_u32(r)?)?;
            let params = get_defs(r)?;
            let returns = get_defs(r)?;
            let mut text = text.into_iter();
            let mut next = || text.next().unwrap_or_default();
            Message::ProcInstall(ProcInstall {
                name: next(),
                blurb: next(),
                help: next(),
                author: next(),
                copyright: next(),
                date: next(),
                menu_path,
                image_types,
                kind,
                params,
                returns,
            })
        }
        MessageType::ProcUninstall => Message::ProcUninstall(get_string(r)?.unwrap_or_default()),
    };
    Ok(message)
}

/// Reads the next message from a channel. A channel that ends partway
/// through surfaces as `TransportError::UnexpectedEof`.
pub fn read_message<T: Transport + ?Sized>(channel: &mut T) -> Result<Message, WireError> {
    let message = decode_message(&mut ChannelReader(channel))?;
    tracing::trace!(message = %message.message_type(), "wire read");
    Ok(message)
}

/// Writes one message as a single transport write. Nothing reaches the peer
/// until the channel is flushed.
pub fn write_message<T: Transport + ?Sized>(
    channel: &mut T,
    message: MessageRef<'_>,
) -> Result<(), WireError> {
    let bytes = encode_message(&message)?;
    channel.write(&bytes)?;
    tracing::trace!(message = %message.message_type(), bytes = bytes.len(), "wire write");
    Ok(())
}

/// [`write_message`] followed by a flush.
pub fn send_message<T: Transport + ?Sized>(
    channel: &mut T,
    message: MessageRef<'_>,
) -> Result<(), WireError> {
    write_message(channel, message)?;
    channel.flush()?;
    Ok(())
}
