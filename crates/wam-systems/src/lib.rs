//! # WAM Systems
//!
//! 信号流图引擎和实时执行管理器。
//!
//! - **系统**（[`System`]）：带类型化输入/输出端口的计算节点
//! - **连接**：一个输出可扇出到多个输入，每个输入最多一个上游
//! - **执行管理器**（[`ExecutionManager`]）：每个周期按拓扑序求值周期系统及其上游
//!
//! ```no_run
//! use wam_systems::{Callback, Constant, ExecutionManager, Probe};
//!
//! let em = ExecutionManager::default();
//! let source = Constant::new(1.0_f64);
//! let double = Callback::new("double", |x: &f64| x * 2.0);
//! let probe = Probe::new("result");
//!
//! let (src, d_in, d_out, p_in, result) =
//!     (source.output(), double.input(), double.output(), probe.input(), probe.output());
//! em.add_system(source);
//! em.add_system(double);
//! em.add_periodic_system(probe);
//! em.connect(&src, &d_in).unwrap();
//! em.connect(&d_out, &p_in).unwrap();
//!
//! em.start().unwrap();
//! // ...
//! em.stop();
//! assert_eq!(result.value(), Some(2.0));
//! ```

mod error;
mod graph;
mod manager;
mod port;
mod system;
pub mod systems;

pub use error::{ExecutionError, GraphError, SystemError};
pub use manager::{
    DEFAULT_PERIOD, ExecutionConfig, ExecutionManager, ExecutionStats, ExecutionStatsSnapshot,
};
pub use port::{AnyInput, AnyOutput, Input, Output, PortKey};
pub use system::{PortList, System, SystemId, TickInfo};
pub use systems::{Callback, Constant, ExposedOutput, Gain, Probe, Sign, Summer};
