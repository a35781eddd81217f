//! Scion 循环垃圾回收器。
//!
//! 候选表只收录"计数引用且可成环"类型的实例。检测分两个阶段：先把
//! 每个候选的引用计数快照下来，再减去候选集合内部的入边；模拟计数为
//! 零且不可从任何正计数对象到达者即为环垃圾。销毁阶段对每个垃圾成员
//! 严格执行一次：先跑析构器，再强制清空出边（级联普通释放），最后释
//! 放对象本体。
//!
//! 状态机可增量推进（每次调用处理一个候选），也可一次跑完整个周期。
//! 析构器在销毁阶段可以分配新对象、登记新候选、甚至中止正在执行的上
//! 下文；这一批销毁仍会完成。运行期间到达的再入回收请求被吸收，不会
//! 嵌套。

use rustc_hash::FxHashMap;

use crate::engine::Engine;
use crate::runtime::heap::ObjectHandle;
use crate::runtime::RuntimeError;
use crate::types::descriptor::TypeId;

/// Run a complete collection cycle before returning.
pub const GC_FULL_CYCLE: u32 = 1;
/// Advance by one bounded increment of work.
pub const GC_ONE_STEP: u32 = 2;
/// Destroy the garbage identified by the last completed detection.
pub const GC_DESTROY_GARBAGE: u32 = 4;
/// Run (or advance) the detection phases.
pub const GC_DETECT_GARBAGE: u32 = 8;

/// Snapshot of the collector's observable numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStatistics {
    /// Live candidate-table size.
    pub current_size: u32,
    /// Objects destroyed by the collector since engine creation.
    pub total_destroyed: u32,
    /// Objects identified as cyclic garbage since engine creation.
    pub total_detected: u32,
    /// Candidates enrolled after the last completed detection pass.
    pub new_objects: u32,
    /// Collector-destroyed objects that never survived a detection pass.
    pub total_new_destroyed: u32,
}

/// Identity of one candidate-table entry, for external inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcObjectInfo {
    pub seq: u32,
    pub handle: ObjectHandle,
    pub type_id: TypeId,
}

/// Fired once per identified cycle member, before the member is
/// destroyed. Runs with full engine access.
pub type CircularRefCallback = Box<dyn FnMut(&mut Engine, TypeId, ObjectHandle)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectState {
    Idle,
    /// Snapshot refcounts and clear marks, one candidate per step.
    ClearCounters(usize),
    /// Subtract intra-set incoming references.
    CountReferences(usize),
    /// Mark everything reachable from candidates with a positive
    /// simulated count as live.
    DetectGarbage(usize),
    /// Collect the unmarked candidates as the garbage set.
    VerifyUnmarked(usize),
}

/// The collector. Owned by the engine and taken out for the duration of
/// a pass so destructors and callbacks get unrestricted engine access.
#[derive(Default)]
pub struct GarbageCollector {
    state: DetectState,
    /// Candidate set fixed at the start of the running detection pass.
    working: Vec<ObjectHandle>,
    /// Simulated reference counts of the working set.
    counts: FxHashMap<ObjectHandle, u32>,
    mark_stack: Vec<ObjectHandle>,
    /// Identified garbage pending destruction.
    garbage: Vec<ObjectHandle>,
    /// Sequence watermark of the garbage set's detection pass.
    garbage_watermark: u32,
    pass_watermark: u32,
    pub(crate) last_detect_seq: u32,
    pub(crate) total_destroyed: u32,
    pub(crate) total_detected: u32,
    pub(crate) total_new_destroyed: u32,
    pub(crate) callback: Option<CircularRefCallback>,
}

impl Default for DetectState {
    fn default() -> Self {
        DetectState::Idle
    }
}

impl GarbageCollector {
    /// Executes a collection request. The engine wrapper guarantees this
    /// is never entered while another pass runs on the same engine.
    pub(crate) fn run(&mut self, engine: &mut Engine, flags: u32) -> Result<(), RuntimeError> {
        let destroy = flags & GC_DESTROY_GARBAGE != 0;
        let detect = flags & GC_DETECT_GARBAGE != 0;
        let one_step = flags & GC_ONE_STEP != 0 && flags & GC_FULL_CYCLE == 0;

        if one_step {
            if destroy && !self.garbage.is_empty() {
                return self.destroy_one(engine);
            }
            if detect {
                self.step_detect(engine)?;
            }
            return Ok(());
        }

        if destroy {
            self.destroy_pending(engine)?;
        }
        if detect {
            // A full pass runs on a fresh snapshot; abandon any
            // incremental detection that was mid-flight.
            self.reset_detect();
            self.step_detect(engine)?;
            while self.state != DetectState::Idle {
                self.step_detect(engine)?;
            }
            if destroy {
                self.destroy_pending(engine)?;
            }
        }
        Ok(())
    }

    fn reset_detect(&mut self) {
        self.state = DetectState::Idle;
        self.working.clear();
        self.counts.clear();
        self.mark_stack.clear();
    }

    /// Advances the detection machine by one candidate's worth of work.
    fn step_detect(&mut self, engine: &mut Engine) -> Result<(), RuntimeError> {
        match self.state {
            DetectState::Idle => {
                engine.purge_gc_table();
                self.working = engine.gc_table_snapshot();
                self.counts.clear();
                self.mark_stack.clear();
                self.pass_watermark = self.last_detect_seq;
                self.state = DetectState::ClearCounters(0);
            }
            DetectState::ClearCounters(i) => {
                if let Some(&handle) = self.working.get(i) {
                    if let Some(count) = engine.object_refcount(handle) {
                        self.counts.insert(handle, count);
                        engine.set_gc_mark(handle, false);
                    }
                    self.state = DetectState::ClearCounters(i + 1);
                } else {
                    self.state = DetectState::CountReferences(0);
                }
            }
            DetectState::CountReferences(i) => {
                if let Some(&handle) = self.working.get(i) {
                    for target in engine.enumerate_object_refs(handle)? {
                        if let Some(count) = self.counts.get_mut(&target) {
                            *count = count.saturating_sub(1);
                        }
                    }
                    self.state = DetectState::CountReferences(i + 1);
                } else {
                    self.state = DetectState::DetectGarbage(0);
                }
            }
            DetectState::DetectGarbage(i) => {
                if let Some(handle) = self.mark_stack.pop() {
                    for target in engine.enumerate_object_refs(handle)? {
                        if self.counts.contains_key(&target) && !engine.gc_mark(target) {
                            engine.set_gc_mark(target, true);
                            self.mark_stack.push(target);
                        }
                    }
                } else if let Some(&handle) = self.working.get(i) {
                    let external = self.counts.get(&handle).copied().unwrap_or(0) > 0;
                    if external && !engine.gc_mark(handle) {
                        engine.set_gc_mark(handle, true);
                        self.mark_stack.push(handle);
                    }
                    self.state = DetectState::DetectGarbage(i + 1);
                } else {
                    self.state = DetectState::VerifyUnmarked(0);
                }
            }
            DetectState::VerifyUnmarked(i) => {
                if let Some(&handle) = self.working.get(i) {
                    let is_garbage = self.counts.contains_key(&handle)
                        && engine.is_enrolled(handle)
                        && !engine.gc_mark(handle);
                    if is_garbage {
                        self.garbage.push(handle);
                    }
                    self.state = DetectState::VerifyUnmarked(i + 1);
                } else {
                    self.total_detected += self.garbage.len() as u32;
                    self.garbage_watermark = self.pass_watermark;
                    self.last_detect_seq = engine.heap_last_seq();
                    log::debug!(
                        "gc detect pass complete: {} candidates, {} garbage",
                        self.working.len(),
                        self.garbage.len()
                    );
                    self.reset_detect();
                }
            }
        }
        Ok(())
    }

    fn destroy_pending(&mut self, engine: &mut Engine) -> Result<(), RuntimeError> {
        while !self.garbage.is_empty() {
            self.destroy_one(engine)?;
        }
        Ok(())
    }

    /// Destroys one identified cycle member. Members that already died
    /// through ordinary releases after detection are skipped.
    fn destroy_one(&mut self, engine: &mut Engine) -> Result<(), RuntimeError> {
        let Some(handle) = self.garbage.pop() else {
            return Ok(());
        };
        if !engine.is_enrolled(handle) {
            return Ok(());
        }
        let seq = engine.object_seq(handle).unwrap_or(0);
        if let Some(type_id) = engine.object_type(handle) {
            let mut callback = self.callback.take();
            if let Some(cb) = callback.as_mut() {
                cb(engine, type_id, handle);
            }
            self.callback = callback;
        }
        engine.destroy_cycle_member(handle);
        self.total_destroyed += 1;
        if seq > self.garbage_watermark {
            self.total_new_destroyed += 1;
        }
        Ok(())
    }

    pub(crate) fn has_pending_garbage(&self) -> bool {
        !self.garbage.is_empty()
    }

    pub(crate) fn detect_in_progress(&self) -> bool {
        self.state != DetectState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(GC_FULL_CYCLE, 1);
        assert_eq!(GC_ONE_STEP, 2);
        assert_eq!(GC_DESTROY_GARBAGE, 4);
        assert_eq!(GC_DETECT_GARBAGE, 8);
    }

    #[test]
    fn test_fresh_collector_is_idle() {
        let gc = GarbageCollector::default();
        assert!(!gc.detect_in_progress());
        assert!(!gc.has_pending_garbage());
        assert_eq!(gc.total_destroyed, 0);
        assert_eq!(gc.total_detected, 0);
    }

    #[test]
    fn test_statistics_default() {
        let stats = GcStatistics::default();
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.new_objects, 0);
    }
}
