//! 信号流图
//!
//! 系统存放在带代数的 arena 中；边以输入端口为键（每个输入最多一条边）。
//! 调度表 = 周期系统及其全部上游，按拓扑序排列；拓扑变化时标记失效，
//! 下一次 tick 重建。

use crate::port::{AnyInput, AnyOutput};
use crate::{ExecutionError, GraphError, PortKey, PortList, System, SystemId, TickInfo};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

struct Occupant {
    system: Box<dyn System>,
    name: String,
    periodic: bool,
    inputs: PortList,
    outputs: PortList,
}

struct Slot {
    generation: u32,
    occupant: Option<Occupant>,
}

struct Edge {
    output: PortKey,
    input: Box<dyn AnyInput>,
}

#[derive(Default)]
pub(crate) struct Graph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    output_owner: HashMap<PortKey, SystemId>,
    input_owner: HashMap<PortKey, SystemId>,
    /// 输入端口 → 边
    edges: HashMap<PortKey, Edge>,
    schedule: Vec<SystemId>,
    dirty: bool,
}

impl Graph {
    fn occupant(&self, id: SystemId) -> Option<&Occupant> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.occupant.as_ref())
    }

    fn occupant_mut(&mut self, id: SystemId) -> Option<&mut Occupant> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.occupant.as_mut())
    }

    fn name_of(&self, id: SystemId) -> String {
        self.occupant(id)
            .map(|o| o.name.clone())
            .unwrap_or_else(|| format!("{:?}", id))
    }

    pub fn contains(&self, id: SystemId) -> bool {
        self.occupant(id).is_some()
    }

    pub fn system_count(&self) -> usize {
        self.slots.iter().filter(|s| s.occupant.is_some()).count()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn insert(&mut self, system: Box<dyn System>) -> SystemId {
        let occupant = Occupant {
            name: system.name().to_string(),
            inputs: system.inputs(),
            outputs: system.outputs(),
            periodic: false,
            system,
        };

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.occupant = Some(occupant);
                SystemId {
                    index,
                    generation: slot.generation,
                }
            },
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    occupant: Some(occupant),
                });
                SystemId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            },
        };

        if let Some(o) = self.occupant(id) {
            let inputs = o.inputs.clone();
            let outputs = o.outputs.clone();
            for key in inputs {
                self.input_owner.insert(key, id);
            }
            for key in outputs {
                self.output_owner.insert(key, id);
            }
        }
        debug!("Registered system '{}' as {:?}", self.name_of(id), id);
        id
    }

    pub fn remove(&mut self, id: SystemId) -> Result<Box<dyn System>, GraphError> {
        let (inputs, outputs) = {
            let o = self.occupant(id).ok_or(GraphError::UnknownSystem(id))?;
            (o.inputs.clone(), o.outputs.clone())
        };

        // 断开本系统的输入，以及所有读取本系统输出的输入
        let dangling: Vec<PortKey> = self
            .edges
            .iter()
            .filter(|(input, edge)| inputs.contains(input) || outputs.contains(&edge.output))
            .map(|(input, _)| *input)
            .collect();
        for key in dangling {
            if let Some(edge) = self.edges.remove(&key) {
                edge.input.unbind_any();
            }
        }
        for key in &inputs {
            self.input_owner.remove(key);
        }
        for key in &outputs {
            self.output_owner.remove(key);
        }

        let slot = &mut self.slots[id.index as usize];
        let occupant = slot.occupant.take().ok_or(GraphError::UnknownSystem(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.dirty = true;

        debug!("Removed system '{}'", occupant.name);
        Ok(occupant.system)
    }

    pub fn set_periodic(&mut self, id: SystemId, periodic: bool) -> Result<(), GraphError> {
        let o = self.occupant_mut(id).ok_or(GraphError::UnknownSystem(id))?;
        if o.periodic != periodic {
            o.periodic = periodic;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn is_periodic(&self, id: SystemId) -> bool {
        self.occupant(id).is_some_and(|o| o.periodic)
    }

    /// 从 `from` 沿下游方向能否到达 `to`（忽略以 `skip_input` 为终点的边）
    fn reaches(&self, from: SystemId, to: SystemId, skip_input: PortKey) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for (input, edge) in &self.edges {
                if *input == skip_input {
                    continue;
                }
                if self.output_owner.get(&edge.output) == Some(&current) {
                    if let Some(&next) = self.input_owner.get(input) {
                        stack.push(next);
                    }
                }
            }
        }
        false
    }

    /// 连接（已连接的输入被原子地改接）
    pub fn connect(
        &mut self,
        output: &dyn AnyOutput,
        input: &dyn AnyInput,
    ) -> Result<(), GraphError> {
        let producer = *self
            .output_owner
            .get(&output.key())
            .ok_or(GraphError::ForeignPort)?;
        let consumer = *self
            .input_owner
            .get(&input.key())
            .ok_or(GraphError::ForeignPort)?;

        if input.value_type_id() != output.value_type_id() {
            return Err(GraphError::TypeMismatch {
                input: input.value_type_name(),
                output: output.value_type_name(),
            });
        }

        if producer == consumer || self.reaches(consumer, producer, input.key()) {
            return Err(GraphError::Cycle {
                producer: self.name_of(producer),
                consumer: self.name_of(consumer),
            });
        }

        input.bind_any(output)?;
        self.edges.insert(
            input.key(),
            Edge {
                output: output.key(),
                input: input.clone_box(),
            },
        );
        self.dirty = true;
        Ok(())
    }

    pub fn disconnect(&mut self, input: PortKey) -> Result<(), GraphError> {
        let edge = self.edges.remove(&input).ok_or(GraphError::NotConnected)?;
        edge.input.unbind_any();
        self.dirty = true;
        Ok(())
    }

    pub fn is_connected(&self, input: PortKey) -> bool {
        self.edges.contains_key(&input)
    }

    fn producer_of(&self, input: &PortKey) -> Option<SystemId> {
        self.edges
            .get(input)
            .and_then(|edge| self.output_owner.get(&edge.output))
            .copied()
    }

    /// 重建调度表：周期系统及其上游，拓扑序
    fn rebuild_schedule(&mut self) -> Result<(), GraphError> {
        // 1. 收集周期系统及其全部上游
        let mut needed: HashSet<SystemId> = HashSet::new();
        let mut queue: VecDeque<SystemId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.occupant.as_ref().filter(|o| o.periodic).map(|_| SystemId {
                    index: index as u32,
                    generation: slot.generation,
                })
            })
            .collect();

        while let Some(id) = queue.pop_front() {
            if !needed.insert(id) {
                continue;
            }
            if let Some(o) = self.occupant(id) {
                for input in &o.inputs {
                    if let Some(producer) = self.producer_of(input) {
                        queue.push_back(producer);
                    }
                }
            }
        }

        // 2. Kahn 拓扑排序（同层按 arena 下标，保证确定性）
        let mut in_degree: HashMap<SystemId, usize> = needed.iter().map(|&id| (id, 0)).collect();
        let mut downstream: HashMap<SystemId, Vec<SystemId>> = HashMap::new();
        for (input, edge) in &self.edges {
            let (Some(&producer), Some(&consumer)) =
                (self.output_owner.get(&edge.output), self.input_owner.get(input))
            else {
                continue;
            };
            if needed.contains(&producer) && needed.contains(&consumer) {
                *in_degree.entry(consumer).or_default() += 1;
                downstream.entry(producer).or_default().push(consumer);
            }
        }

        let mut ready: Vec<SystemId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_by_key(|id| std::cmp::Reverse(id.index));

        let mut order = Vec::with_capacity(needed.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            if let Some(next) = downstream.get(&id) {
                for consumer in next {
                    if let Some(d) = in_degree.get_mut(consumer) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(*consumer);
                            ready.sort_by_key(|id| std::cmp::Reverse(id.index));
                        }
                    }
                }
            }
        }

        if order.len() != needed.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(id, _)| *id);
            let name = stuck.map(|id| self.name_of(id)).unwrap_or_default();
            warn!("Cycle detected in signal-flow graph at '{}'", name);
            return Err(GraphError::Cycle {
                producer: name.clone(),
                consumer: name,
            });
        }

        self.schedule = order;
        self.dirty = false;
        Ok(())
    }

    /// 当前调度表（必要时重建）
    pub fn schedule(&mut self) -> Result<&[SystemId], GraphError> {
        if self.dirty {
            self.rebuild_schedule()?;
        }
        Ok(&self.schedule)
    }

    /// 按调度表求值一次
    ///
    /// 单个系统失败不影响其他系统；返回第一个错误。
    pub fn tick(&mut self, info: &TickInfo) -> Result<(), ExecutionError> {
        if self.dirty {
            self.rebuild_schedule()?;
        }

        let Graph {
            schedule, slots, ..
        } = self;

        let mut first_error = None;
        for id in schedule.iter() {
            let Some(o) = slots
                .get_mut(id.index as usize)
                .filter(|s| s.generation == id.generation)
                .and_then(|s| s.occupant.as_mut())
            else {
                continue;
            };
            if let Err(source) = o.system.operate(info) {
                if first_error.is_none() {
                    first_error = Some(ExecutionError::System {
                        name: o.name.clone(),
                        source,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 测试用：强制插入一条边，绕过环检测
    #[cfg(test)]
    fn force_edge(&mut self, output: &dyn AnyOutput, input: &dyn AnyInput) {
        input.bind_any(output).unwrap();
        self.edges.insert(
            input.key(),
            Edge {
                output: output.key(),
                input: input.clone_box(),
            },
        );
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{Input, Output};
    use crate::SystemError;
    use smallvec::smallvec;
    use std::time::{Duration, Instant};

    struct Pass {
        name: &'static str,
        input: Input<i32>,
        output: Output<i32>,
    }

    impl Pass {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                input: Input::new(),
                output: Output::new(),
            }
        }
    }

    impl System for Pass {
        fn name(&self) -> &str {
            self.name
        }

        fn inputs(&self) -> PortList {
            smallvec![self.input.key()]
        }

        fn outputs(&self) -> PortList {
            smallvec![self.output.key()]
        }

        fn operate(&mut self, _tick: &TickInfo) -> Result<(), SystemError> {
            let v = self.input.value().unwrap_or(0);
            self.output.set(v + 1);
            Ok(())
        }
    }

    fn tick_info() -> TickInfo {
        TickInfo {
            tick: 0,
            dt: Duration::from_millis(2),
            now: Instant::now(),
        }
    }

    #[test]
    fn test_connect_rejects_cycle() {
        let mut g = Graph::default();
        let a = Pass::new("a");
        let b = Pass::new("b");
        let (a_in, a_out, b_in, b_out) = (
            a.input.clone(),
            a.output.clone(),
            b.input.clone(),
            b.output.clone(),
        );
        g.insert(Box::new(a));
        g.insert(Box::new(b));

        g.connect(&a_out, &b_in).unwrap();
        let err = g.connect(&b_out, &a_in).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        assert!(!a_in.is_connected());

        // 自环
        assert!(matches!(
            g.connect(&a_out, &a_in),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_reconnect_replaces_edge_without_false_cycle() {
        let mut g = Graph::default();
        let a = Pass::new("a");
        let b = Pass::new("b");
        let (a_in, a_out, b_in, b_out) = (
            a.input.clone(),
            a.output.clone(),
            b.input.clone(),
            b.output.clone(),
        );
        g.insert(Box::new(a));
        g.insert(Box::new(b));

        // a -> b，然后把 a 的输入接到 b：会成环
        g.connect(&a_out, &b_in).unwrap();
        assert!(g.connect(&b_out, &a_in).is_err());

        // 先把 b 的输入改接到别处（这里断开），再接 b -> a 合法
        g.disconnect(b_in.key()).unwrap();
        g.connect(&b_out, &a_in).unwrap();
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn test_foreign_port() {
        let mut g = Graph::default();
        let a = Pass::new("a");
        let a_in = a.input.clone();
        g.insert(Box::new(a));

        let stray: Output<i32> = Output::new();
        assert_eq!(g.connect(&stray, &a_in), Err(GraphError::ForeignPort));
    }

    #[test]
    fn test_schedule_is_topological_and_limited_to_upstream() {
        let mut g = Graph::default();
        let a = Pass::new("a");
        let b = Pass::new("b");
        let c = Pass::new("c");
        let unrelated = Pass::new("unrelated");
        let (a_out, b_in, b_out, c_in) = (
            a.output.clone(),
            b.input.clone(),
            b.output.clone(),
            c.input.clone(),
        );
        // 故意倒序注册
        let c_id = g.insert(Box::new(c));
        let b_id = g.insert(Box::new(b));
        let a_id = g.insert(Box::new(a));
        g.insert(Box::new(unrelated));

        g.connect(&b_out, &c_in).unwrap();
        g.connect(&a_out, &b_in).unwrap();
        g.set_periodic(c_id, true).unwrap();

        assert_eq!(g.schedule().unwrap(), &[a_id, b_id, c_id]);
    }

    #[test]
    fn test_cycle_surviving_to_tick_is_reported() {
        let mut g = Graph::default();
        let a = Pass::new("a");
        let b = Pass::new("b");
        let (a_in, a_out, b_in, b_out) = (
            a.input.clone(),
            a.output.clone(),
            b.input.clone(),
            b.output.clone(),
        );
        let a_id = g.insert(Box::new(a));
        g.insert(Box::new(b));
        g.connect(&a_out, &b_in).unwrap();
        g.force_edge(&b_out, &a_in);
        g.set_periodic(a_id, true).unwrap();

        let err = g.tick(&tick_info()).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Graph(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_remove_disconnects_both_directions() {
        let mut g = Graph::default();
        let a = Pass::new("a");
        let b = Pass::new("b");
        let c = Pass::new("c");
        let (a_out, b_in, b_out, c_in) = (
            a.output.clone(),
            b.input.clone(),
            b.output.clone(),
            c.input.clone(),
        );
        g.insert(Box::new(a));
        let b_id = g.insert(Box::new(b));
        g.insert(Box::new(c));
        g.connect(&a_out, &b_in).unwrap();
        g.connect(&b_out, &c_in).unwrap();

        g.remove(b_id).unwrap();
        assert_eq!(g.edge_count(), 0);
        assert!(!c_in.is_connected());
        assert!(!g.contains(b_id));

        // 旧句柄失效，槽位被复用后也不会指向新系统
        let d_id = g.insert(Box::new(Pass::new("d")));
        assert_eq!(d_id.index, b_id.index);
        assert_ne!(d_id, b_id);
        assert!(matches!(
            g.set_periodic(b_id, true),
            Err(GraphError::UnknownSystem(_))
        ));
    }
}
