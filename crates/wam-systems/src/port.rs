//! 类型化端口
//!
//! - [`Output<T>`]：生产者写入的值单元（`Arc` 共享，可扇出到多个输入）
//! - [`Input<T>`]：指向某个输出值单元的绑定（`arc-swap`，读取无锁）
//!
//! 端口句柄可以克隆：克隆体与原端口是同一个端口。系统内部持有一份，
//! 调用者拿另一份去 `connect`。

use crate::GraphError;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::sync::Arc;

/// 端口身份：值单元的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey(usize);

impl PortKey {
    fn of<C>(cell: &Arc<C>) -> Self {
        PortKey(Arc::as_ptr(cell) as *const () as usize)
    }
}

struct OutputCell<T> {
    value: Mutex<Option<T>>,
}

/// 输出端口
pub struct Output<T> {
    cell: Arc<OutputCell<T>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("key", &self.key())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Output<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Output<T> {
    /// 没有初始值的输出：首次求值前下游读到 `None`
    pub fn new() -> Self {
        Self {
            cell: Arc::new(OutputCell {
                value: Mutex::new(None),
            }),
        }
    }

    /// 带初始值的输出：首次求值前下游读到该值
    pub fn with_initial(value: T) -> Self {
        Self {
            cell: Arc::new(OutputCell {
                value: Mutex::new(Some(value)),
            }),
        }
    }

    pub fn set(&self, value: T) {
        *self.cell.value.lock() = Some(value);
    }

    /// 输出变为未定义
    pub fn clear(&self) {
        *self.cell.value.lock() = None;
    }

    pub fn value(&self) -> Option<T> {
        self.cell.value.lock().clone()
    }
}

impl<T> Output<T> {
    pub fn key(&self) -> PortKey {
        PortKey::of(&self.cell)
    }
}

type Binding<T> = ArcSwapOption<OutputCell<T>>;

/// 输入端口
pub struct Input<T> {
    binding: Arc<Binding<T>>,
}

impl<T> Clone for Input<T> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
        }
    }
}

impl<T> Input<T> {
    pub fn is_connected(&self) -> bool {
        self.binding.load().is_some()
    }

    pub fn key(&self) -> PortKey {
        PortKey::of(&self.binding)
    }

    /// 当前绑定的输出端口
    pub fn bound_output(&self) -> Option<PortKey> {
        (*self.binding.load()).as_ref().map(PortKey::of)
    }
}

impl<T> std::fmt::Debug for Input<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("key", &PortKey::of(&self.binding))
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Input<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Input<T> {
    pub fn new() -> Self {
        Self {
            binding: Arc::new(ArcSwapOption::const_empty()),
        }
    }

    /// 读取上游输出的当前值；未连接或上游未定义时为 `None`
    pub fn value(&self) -> Option<T> {
        let guard = self.binding.load();
        (*guard).as_ref().and_then(|cell| cell.value.lock().clone())
    }

    pub(crate) fn bind(&self, output: &Output<T>) {
        self.binding.store(Some(output.cell.clone()));
    }

    pub(crate) fn unbind(&self) {
        self.binding.store(None);
    }
}

/// 类型擦除的输出端口（用于运行时类型检查的连接入口）
pub trait AnyOutput: Send + Sync {
    fn key(&self) -> PortKey;
    fn value_type_id(&self) -> TypeId;
    fn value_type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

/// 类型擦除的输入端口
pub trait AnyInput: Send + Sync {
    fn key(&self) -> PortKey;
    fn value_type_id(&self) -> TypeId;
    fn value_type_name(&self) -> &'static str;
    fn bound_output(&self) -> Option<PortKey>;

    /// 绑定到输出；值类型不一致时返回 `TypeMismatch`
    fn bind_any(&self, output: &dyn AnyOutput) -> Result<(), GraphError>;
    fn unbind_any(&self);
    fn clone_box(&self) -> Box<dyn AnyInput>;
}

impl<T: Clone + Send + 'static> AnyOutput for Output<T> {
    fn key(&self) -> PortKey {
        Output::key(self)
    }

    fn value_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn value_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: Clone + Send + 'static> AnyInput for Input<T> {
    fn key(&self) -> PortKey {
        Input::key(self)
    }

    fn value_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn value_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn bound_output(&self) -> Option<PortKey> {
        Input::bound_output(self)
    }

    fn bind_any(&self, output: &dyn AnyOutput) -> Result<(), GraphError> {
        let output = output
            .as_any()
            .downcast_ref::<Output<T>>()
            .ok_or_else(|| GraphError::TypeMismatch {
                input: std::any::type_name::<T>(),
                output: output.value_type_name(),
            })?;
        self.bind(output);
        Ok(())
    }

    fn unbind_any(&self) {
        self.unbind();
    }

    fn clone_box(&self) -> Box<dyn AnyInput> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconnected_input_is_undefined() {
        let input: Input<f64> = Input::new();
        assert!(!input.is_connected());
        assert_eq!(input.value(), None);
    }

    #[test]
    fn test_initial_value_visible_before_first_set() {
        let output = Output::with_initial(1.5);
        let input = Input::new();
        input.bind(&output);
        assert_eq!(input.value(), Some(1.5));
        output.set(2.5);
        assert_eq!(input.value(), Some(2.5));
    }

    #[test]
    fn test_clones_share_identity() {
        let output: Output<i32> = Output::new();
        let input: Input<i32> = Input::new();
        assert_eq!(output.key(), output.clone().key());
        assert_eq!(input.key(), input.clone().key());

        input.clone().bind(&output);
        assert_eq!(input.bound_output(), Some(output.key()));
    }

    #[test]
    fn test_bind_any_checks_type() {
        let output: Output<f64> = Output::new();
        let input: Input<i32> = Input::new();
        let err = input.bind_any(&output).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert!(!input.is_connected());

        let good: Input<f64> = Input::new();
        good.bind_any(&output).unwrap();
        assert!(good.is_connected());
    }
}
