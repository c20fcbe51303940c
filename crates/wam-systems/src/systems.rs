//! 内置系统

use crate::port::{Input, Output};
use crate::{PortList, System, SystemError, TickInfo};
use smallvec::smallvec;
use std::ops::{Add, Mul, Neg, Sub};

/// 常量源
pub struct Constant<T> {
    value: T,
    output: Output<T>,
}

impl<T: Clone + Send + 'static> Constant<T> {
    pub fn new(value: T) -> Self {
        Self {
            output: Output::with_initial(value.clone()),
            value,
        }
    }

    pub fn output(&self) -> Output<T> {
        self.output.clone()
    }
}

impl<T: Clone + Send + 'static> System for Constant<T> {
    fn name(&self) -> &str {
        "constant"
    }

    fn outputs(&self) -> PortList {
        smallvec![self.output.key()]
    }

    fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
        self.output.set(self.value.clone());
        Ok(())
    }
}

/// 由外部线程写入的输出
///
/// `set_value` 可在任意线程调用，下游在下一次 tick 读到新值。
pub struct ExposedOutput<T> {
    name: String,
    output: Output<T>,
}

impl<T: Clone + Send + 'static> ExposedOutput<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Output::new(),
        }
    }

    pub fn with_initial(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            output: Output::with_initial(value),
        }
    }

    pub fn output(&self) -> Output<T> {
        self.output.clone()
    }

    pub fn set_value(&self, value: T) {
        self.output.set(value);
    }

    pub fn clear(&self) {
        self.output.clear();
    }
}

impl<T: Clone + Send + 'static> System for ExposedOutput<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn outputs(&self) -> PortList {
        smallvec![self.output.key()]
    }

    fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
        Ok(())
    }
}

/// 把输入值镜像到输出，供非实时线程观察
pub struct Probe<T> {
    name: String,
    input: Input<T>,
    output: Output<T>,
}

impl<T: Clone + Send + 'static> Probe<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: Input::new(),
            output: Output::new(),
        }
    }

    pub fn input(&self) -> Input<T> {
        self.input.clone()
    }

    pub fn output(&self) -> Output<T> {
        self.output.clone()
    }
}

impl<T: Clone + Send + 'static> System for Probe<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> PortList {
        smallvec![self.input.key()]
    }

    fn outputs(&self) -> PortList {
        smallvec![self.output.key()]
    }

    fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
        match self.input.value() {
            Some(v) => self.output.set(v),
            None => self.output.clear(),
        }
        Ok(())
    }
}

/// 对输入逐 tick 调用闭包
///
/// 输入未定义时输出也变为未定义，闭包不被调用。
pub struct Callback<I, O, F> {
    name: String,
    f: F,
    input: Input<I>,
    output: Output<O>,
}

impl<I, O, F> Callback<I, O, F>
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
    F: FnMut(&I) -> O + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            input: Input::new(),
            output: Output::new(),
        }
    }

    pub fn input(&self) -> Input<I> {
        self.input.clone()
    }

    pub fn output(&self) -> Output<O> {
        self.output.clone()
    }
}

impl<I, O, F> System for Callback<I, O, F>
where
    I: Clone + Send + 'static,
    O: Clone + Send + 'static,
    F: FnMut(&I) -> O + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> PortList {
        smallvec![self.input.key()]
    }

    fn outputs(&self) -> PortList {
        smallvec![self.output.key()]
    }

    fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
        match self.input.value() {
            Some(v) => self.output.set((self.f)(&v)),
            None => self.output.clear(),
        }
        Ok(())
    }
}

/// 标量增益 `y = k * x`
pub struct Gain<T> {
    gain: f64,
    input: Input<T>,
    output: Output<T>,
}

impl<T> Gain<T>
where
    T: Clone + Send + Mul<f64, Output = T> + 'static,
{
    pub fn new(gain: f64) -> Self {
        Self {
            gain,
            input: Input::new(),
            output: Output::new(),
        }
    }

    pub fn set_gain(&mut self, gain: f64) {
        self.gain = gain;
    }

    pub fn input(&self) -> Input<T> {
        self.input.clone()
    }

    pub fn output(&self) -> Output<T> {
        self.output.clone()
    }
}

impl<T> System for Gain<T>
where
    T: Clone + Send + Mul<f64, Output = T> + 'static,
{
    fn name(&self) -> &str {
        "gain"
    }

    fn inputs(&self) -> PortList {
        smallvec![self.input.key()]
    }

    fn outputs(&self) -> PortList {
        smallvec![self.output.key()]
    }

    fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
        match self.input.value() {
            Some(v) => self.output.set(v * self.gain),
            None => self.output.clear(),
        }
        Ok(())
    }
}

/// 求和符号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

/// 带符号求和 `y = ±x0 ± x1 ± ...`
///
/// 任一输入未定义时输出未定义。
pub struct Summer<T> {
    signs: Vec<Sign>,
    inputs: Vec<Input<T>>,
    output: Output<T>,
}

impl<T> Summer<T>
where
    T: Clone + Send + Add<Output = T> + Sub<Output = T> + Neg<Output = T> + 'static,
{
    pub fn new(signs: &[Sign]) -> Self {
        Self {
            signs: signs.to_vec(),
            inputs: signs.iter().map(|_| Input::new()).collect(),
            output: Output::new(),
        }
    }

    /// `a - b` 的常用形式
    pub fn difference() -> Self {
        Self::new(&[Sign::Plus, Sign::Minus])
    }

    pub fn input(&self, index: usize) -> Option<Input<T>> {
        self.inputs.get(index).cloned()
    }

    pub fn output(&self) -> Output<T> {
        self.output.clone()
    }
}

impl<T> System for Summer<T>
where
    T: Clone + Send + Add<Output = T> + Sub<Output = T> + Neg<Output = T> + 'static,
{
    fn name(&self) -> &str {
        "summer"
    }

    fn inputs(&self) -> PortList {
        self.inputs.iter().map(|i| i.key()).collect()
    }

    fn outputs(&self) -> PortList {
        smallvec![self.output.key()]
    }

    fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
        let mut sum: Option<T> = None;
        for (input, sign) in self.inputs.iter().zip(&self.signs) {
            let Some(v) = input.value() else {
                self.output.clear();
                return Ok(());
            };
            sum = Some(match (sum, sign) {
                (None, Sign::Plus) => v,
                (None, Sign::Minus) => -v,
                (Some(s), Sign::Plus) => s + v,
                (Some(s), Sign::Minus) => s - v,
            });
        }
        match sum {
            Some(v) => self.output.set(v),
            None => self.output.clear(),
        }
        Ok(())
    }
}
