//! 线协议模块：帧格式、编解码器与任务结果消息

pub mod codec;
pub mod message;
pub mod packer;

pub use codec::{BincodeCodec, Codec, CodecError, JsonCodec};
pub use message::{ExceptionKind, TaskResult, WorkerException};
pub use packer::{
    default_packer_factory, FrameError, FramePacker, Packer, PackerFactory, HEADER_LEN,
    MESSAGE_START_BYTE, MIN_BUFFER_SIZE,
};
