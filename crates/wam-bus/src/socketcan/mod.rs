//! SocketCAN 适配器
//!
//! Linux 内核 CAN 接口。波特率等配置由系统工具完成：
//!
//! ```text
//! sudo ip link set can0 type can bitrate 1000000
//! sudo ip link set up can0
//! ```
//!
//! Puck 总线只使用 11 位标准帧，收到的扩展帧和错误帧会被丢弃。

use crate::{BusDeviceError, BusDeviceErrorKind, BusError, BusFrame, CanAdapter};
use socketcan::{
    CanError as SocketCanError, CanErrorFrame, CanFrame, CanSocket, EmbeddedFrame, Frame, Socket,
    StandardId,
};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{error, trace, warn};

/// SO_RCVTIMEO 为 0 表示无限阻塞，超时至少取 1µs
const MIN_READ_TIMEOUT: Duration = Duration::from_micros(1);

/// SocketCAN 适配器
///
/// # 示例
///
/// ```no_run
/// use wam_bus::{BusFrame, CanAdapter, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// adapter.send(BusFrame::new(0x001, &[5])).unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
    nonblocking: bool,
}

impl SocketCanAdapter {
    /// 打开 CAN 接口
    ///
    /// # 错误
    /// - `BusError::Device`: 接口不存在或无法打开
    /// - `BusError::Io`: 设置读超时失败
    pub fn new(interface: impl Into<String>) -> Result<Self, BusError> {
        let interface = interface.into();

        let socket = CanSocket::open(&interface).map_err(|e| {
            let kind = match e.kind() {
                ErrorKind::NotFound => BusDeviceErrorKind::NotFound,
                ErrorKind::PermissionDenied => BusDeviceErrorKind::AccessDenied,
                _ => BusDeviceErrorKind::Backend,
            };
            BusError::Device(BusDeviceError::new(
                kind,
                format!(
                    "Failed to open CAN interface '{}': {}. Is it up? Try: sudo ip link set up {}",
                    interface, e, interface
                ),
            ))
        })?;

        let read_timeout = Duration::from_millis(2);
        socket.set_read_timeout(read_timeout).map_err(BusError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);

        Ok(Self {
            socket,
            interface,
            read_timeout,
            nonblocking: false,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), BusError> {
        if self.nonblocking != nonblocking {
            self.socket.set_nonblocking(nonblocking).map_err(BusError::Io)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), BusError> {
        let timeout = timeout.max(MIN_READ_TIMEOUT);
        if self.read_timeout != timeout {
            self.socket.set_read_timeout(timeout).map_err(BusError::Io)?;
            self.read_timeout = timeout;
        }
        Ok(())
    }

    /// 读取一个数据帧；错误帧和扩展帧返回 `Ok(None)`
    fn read_data_frame(&mut self) -> Result<Option<BusFrame>, BusError> {
        let frame = match self.socket.read_frame() {
            Ok(frame) => frame,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(BusError::Timeout);
            },
            Err(e) => return Err(BusError::Io(e)),
        };

        if frame.is_error_frame() {
            return match CanErrorFrame::try_from(frame) {
                Ok(error_frame) => match SocketCanError::from(error_frame) {
                    SocketCanError::BusOff => {
                        error!("CAN Bus Off error detected on '{}'", self.interface);
                        Err(BusError::BusOff)
                    },
                    other => {
                        warn!("CAN error frame received: {}, ignoring", other);
                        Ok(None)
                    },
                },
                Err(_) => {
                    warn!("Received CAN error frame but failed to parse, ignoring");
                    Ok(None)
                },
            };
        }

        if frame.is_extended() {
            trace!("Dropping extended frame 0x{:X}", frame.raw_id());
            return Ok(None);
        }

        Ok(Some(to_bus_frame(&frame)))
    }
}

fn to_bus_frame(frame: &CanFrame) -> BusFrame {
    BusFrame::new((frame.raw_id() & 0x7FF) as u16, frame.data())
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: BusFrame) -> Result<(), BusError> {
        let can_frame = StandardId::new(frame.id)
            .and_then(|id| CanFrame::new(id, frame.data_slice()))
            .ok_or_else(|| {
                BusError::Device(BusDeviceError::new(
                    BusDeviceErrorKind::InvalidFrame,
                    format!("Failed to create standard frame with ID 0x{:X}", frame.id),
                ))
            })?;

        // 发送始终阻塞：非阻塞模式下队列满会丢帧
        self.set_nonblocking(false)?;
        self.socket.write_frame(&can_frame).map_err(BusError::Io)?;

        trace!("Sent CAN frame: ID=0x{:03X}, len={}", frame.id, frame.len);
        Ok(())
    }

    fn receive_timeout(&mut self, timeout: Duration) -> Result<BusFrame, BusError> {
        self.set_nonblocking(false)?;
        self.set_read_timeout(timeout)?;
        loop {
            if let Some(frame) = self.read_data_frame()? {
                trace!("Received CAN frame: ID=0x{:03X}, len={}", frame.id, frame.len);
                return Ok(frame);
            }
        }
    }

    fn try_receive(&mut self) -> Result<Option<BusFrame>, BusError> {
        self.set_nonblocking(true)?;
        loop {
            match self.read_data_frame() {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => continue,
                Err(BusError::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}
