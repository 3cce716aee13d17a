
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use test_utils::{init_logger, random_string};
use zerg_hive::proto::{
    default_packer_factory, BincodeCodec, FrameError, FramePacker, JsonCodec, Packer,
    PackerFactory,
};
use zerg_hive::{Channel, ChannelConfig, ChannelError, TaskResult, WorkerException};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    payload: String,
}

fn config(buffer_size: usize) -> ChannelConfig {
    ChannelConfig {
        buffer_size,
        ..ChannelConfig::default()
    }
}

/// 读到一条完整消息为止
fn receive_blocking<T: serde::de::DeserializeOwned, C: zerg_hive::proto::Codec>(
    channel: &mut Channel<C>,
) -> T {
    for _ in 0..10_000 {
        if let Some(value) = channel.receive().unwrap() {
            return value;
        }
        std::thread::yield_now();
    }
    panic!("no message received");
}

#[test]
fn test_large_strings_over_socket_pair() {
    init_logger();
    let (mut parent, mut child) =
        Channel::pair(config(1024), BincodeCodec, &default_packer_factory()).unwrap();

    for len in [10_000, 20_000, 30_000] {
        let message = random_string(len);
        parent.send(&message).unwrap();
        let got: String = receive_blocking(&mut child);
        assert_eq!(got, message);
    }
}

#[test]
fn test_both_directions_with_json() {
    init_logger();
    let (mut parent, mut child) =
        Channel::pair(config(32), JsonCodec, &default_packer_factory()).unwrap();

    let job = Job {
        id: 7,
        payload: "x".repeat(100),
    };
    parent.send(&job).unwrap();
    let received: Job = receive_blocking(&mut child);
    assert_eq!(received, job);

    let reply: TaskResult<u32> = Err(WorkerException::timeout(1));
    child.send(&reply).unwrap();
    let back: TaskResult<u32> = receive_blocking(&mut parent);
    assert!(back.unwrap_err().is_timeout());
}

#[test]
fn test_several_messages_in_one_read() {
    init_logger();
    let (mut parent, mut child) =
        Channel::pair(config(4096), BincodeCodec, &default_packer_factory()).unwrap();

    for i in 0..10u32 {
        parent.send(&i).unwrap();
    }
    let got: Vec<u32> = (0..10).map(|_| receive_blocking(&mut child)).collect();
    assert_eq!(got, (0..10).collect::<Vec<_>>());
    assert_eq!(child.receive::<u32>().unwrap(), None);
}

#[test]
fn test_none_is_not_the_sentinel() {
    let (mut parent, mut child) =
        Channel::pair(config(64), BincodeCodec, &default_packer_factory()).unwrap();

    assert_eq!(child.receive::<TaskResult<Option<i32>>>().unwrap(), None);
    parent.send(&TaskResult::<Option<i32>>::Ok(None)).unwrap();
    assert_eq!(
        receive_blocking::<TaskResult<Option<i32>>, _>(&mut child),
        Ok(None)
    );
}

#[test]
fn test_peer_close_is_detected() {
    let (mut parent, mut child) =
        Channel::pair(config(64), BincodeCodec, &default_packer_factory()).unwrap();

    parent.send(&"last words").unwrap();
    drop(parent);

    let got: String = receive_blocking(&mut child);
    assert_eq!(got, "last words");
    assert_eq!(child.receive::<String>().unwrap(), None);
    assert!(child.is_peer_closed());
}

#[test]
fn test_decode_error_surfaces() {
    let (mut parent, mut child) =
        Channel::pair(config(64), BincodeCodec, &default_packer_factory()).unwrap();

    parent.send(&1u8).unwrap();
    let mut result = Ok(None);
    for _ in 0..1000 {
        result = child.receive::<String>();
        if !matches!(result, Ok(None)) {
            break;
        }
    }
    assert!(matches!(result, Err(ChannelError::Codec(_))));
}

/// 固定前缀的自定义帧格式
struct TaggedPacker {
    inner: FramePacker,
}

impl Packer for TaggedPacker {
    fn pack(&self, message: &[u8]) -> Result<Vec<bytes::Bytes>, FrameError> {
        let mut tagged = b"tag:".to_vec();
        tagged.extend_from_slice(message);
        self.inner.pack(&tagged)
    }

    fn unpack(&mut self, fragment: &[u8]) -> Vec<bytes::Bytes> {
        self.inner
            .unpack(fragment)
            .into_iter()
            .map(|mut message| message.split_off(4))
            .collect()
    }
}

#[test]
fn test_custom_packer_factory() {
    let factory: PackerFactory = Arc::new(|size| {
        Ok(Box::new(TaggedPacker {
            inner: FramePacker::new(size)?,
        }) as Box<dyn Packer>)
    });
    let (mut parent, mut child) = Channel::pair(config(16), BincodeCodec, &factory).unwrap();

    parent.send(&vec![1u64, 2, 3]).unwrap();
    let got: Vec<u64> = receive_blocking(&mut child);
    assert_eq!(got, vec![1, 2, 3]);
}

#[test]
fn test_buffer_too_small() {
    let err = Channel::pair(config(5), BincodeCodec, &default_packer_factory()).unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Frame(FrameError::InvalidBufferSize { size: 5, min: 6 })
    ));
}

#[test]
fn test_send_gives_up_after_write_timeout() {
    init_logger();
    let quick = ChannelConfig {
        buffer_size: 4096,
        write_timeout_secs: 0,
        write_timeout_micros: 5_000,
    };
    let (mut parent, _child) =
        Channel::pair(quick, BincodeCodec, &default_packer_factory()).unwrap();

    // 对端不读，socket 缓冲区很快写满
    let payload = vec![7u8; 8 * 1024 * 1024];
    let start = std::time::Instant::now();
    parent.send(&payload).unwrap();
    assert!(start.elapsed() < std::time::Duration::from_secs(2));
    assert!(!parent.is_closed());
}

#[test]
fn test_large_payload_with_concurrent_reader() {
    init_logger();
    let (mut parent, mut child) =
        Channel::pair(config(256 * 1024), BincodeCodec, &default_packer_factory()).unwrap();

    let reader = std::thread::spawn(move || loop {
        if let Some(bytes) = child.receive::<Vec<u8>>().unwrap() {
            return bytes;
        }
        std::thread::sleep(std::time::Duration::from_micros(200));
    });

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    parent.send(&payload).unwrap();
    let got = reader.join().unwrap();
    assert_eq!(got.len(), payload.len());
    assert!(got == payload);
}
