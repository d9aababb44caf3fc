//! Debugger overlay: breakpoints, step modes and the pause predicate.
//!
//! The overlay holds no reference to the machine. The interpreter asks
//! [`DebugState::should_pause_at`] before each instruction and reports calls
//! and returns through [`DebugState::enter_call`] / [`DebugState::exit_call`].

use std::collections::HashMap;

use super::instruction::parse_literal;
use super::ops::binary_op;
use super::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub line: usize,
    pub pc: usize,
    pub enabled: bool,
    pub condition: Option<String>,
    /// Removed after it fires once.
    pub temporary: bool,
}

impl Breakpoint {
    pub fn new(line: usize, pc: usize) -> Self {
        Self {
            line,
            pc,
            enabled: true,
            condition: None,
            temporary: false,
        }
    }

    fn matches(&self, pc: usize, line: usize) -> bool {
        self.enabled && (self.pc == pc || self.line == line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugCommand {
    #[default]
    None,
    Step,
    StepOver,
    StepInto,
    StepOut,
    Continue,
    Break,
}

/// Outcome of a debug run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEvent {
    Paused { pc: usize, line: usize },
    Halted,
}

#[derive(Debug, Default)]
pub struct DebugState {
    pub debugging: bool,
    pub pending: DebugCommand,
    pub breakpoints: Vec<Breakpoint>,
    /// Names of the user functions currently executing, innermost last.
    pub call_stack: Vec<String>,
    /// Call depth recorded when a step-over or step-out was issued.
    pub step_over_depth: usize,
    pub is_stepping: bool,
    pub call_depth: usize,
}

impl DebugState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_breakpoint(&mut self, line: usize, pc: usize) {
        self.breakpoints.push(Breakpoint::new(line, pc));
    }

    pub fn add_conditional_breakpoint(&mut self, line: usize, pc: usize, condition: &str) {
        self.breakpoints.push(Breakpoint {
            condition: Some(condition.to_string()),
            ..Breakpoint::new(line, pc)
        });
    }

    pub fn add_temporary_breakpoint(&mut self, line: usize, pc: usize) {
        self.breakpoints.push(Breakpoint {
            temporary: true,
            ..Breakpoint::new(line, pc)
        });
    }

    pub fn remove_breakpoint(&mut self, line: usize) {
        self.breakpoints.retain(|bp| bp.line != line || bp.temporary);
    }

    pub fn remove_breakpoint_by_pc(&mut self, pc: usize) {
        self.breakpoints.retain(|bp| bp.pc != pc || bp.temporary);
    }

    pub fn enable_breakpoint(&mut self, line: usize) {
        self.set_enabled(line, true);
    }

    pub fn disable_breakpoint(&mut self, line: usize) {
        self.set_enabled(line, false);
    }

    fn set_enabled(&mut self, line: usize, enabled: bool) {
        for bp in self.breakpoints.iter_mut().filter(|bp| bp.line == line) {
            bp.enabled = enabled;
        }
    }

    pub fn step(&mut self) {
        self.pending = DebugCommand::Step;
        self.is_stepping = true;
    }

    pub fn step_over(&mut self) {
        self.pending = DebugCommand::StepOver;
        self.is_stepping = true;
        self.step_over_depth = self.call_depth;
    }

    pub fn step_into(&mut self) {
        self.pending = DebugCommand::StepInto;
        self.is_stepping = true;
    }

    pub fn step_out(&mut self) {
        self.pending = DebugCommand::StepOut;
        self.is_stepping = true;
        self.step_over_depth = self.call_depth;
    }

    pub fn continue_execution(&mut self) {
        self.pending = DebugCommand::Continue;
        self.is_stepping = false;
    }

    pub fn request_break(&mut self) {
        self.pending = DebugCommand::Break;
    }

    /// True when a debug run has to check before every instruction.
    pub fn is_active(&self) -> bool {
        !self.breakpoints.is_empty() || self.is_stepping || self.pending == DebugCommand::Break
    }

    pub fn enter_call(&mut self, name: &str) {
        self.call_stack.push(name.to_string());
        self.call_depth += 1;
    }

    pub fn exit_call(&mut self) {
        self.call_stack.pop();
        self.call_depth = self.call_depth.saturating_sub(1);
    }

    /// Called once a pause has been reported.
    pub fn clear_pending(&mut self) {
        self.pending = DebugCommand::None;
        self.is_stepping = false;
    }

    /// Decide whether to stop before executing the instruction at `pc`.
    pub fn should_pause_at(
        &mut self,
        pc: usize,
        line: usize,
        variables: &HashMap<String, Value>,
    ) -> bool {
        let hit = self.breakpoints.iter().position(|bp| {
            bp.matches(pc, line)
                && bp
                    .condition
                    .as_deref()
                    .is_none_or(|cond| evaluate_condition(cond, variables))
        });
        if let Some(index) = hit {
            if self.breakpoints[index].temporary {
                self.breakpoints.remove(index);
            }
            return true;
        }

        match self.pending {
            DebugCommand::Step | DebugCommand::StepInto | DebugCommand::Break => true,
            DebugCommand::StepOver => self.call_depth <= self.step_over_depth,
            DebugCommand::StepOut => self.call_depth < self.step_over_depth,
            DebugCommand::None | DebugCommand::Continue => false,
        }
    }
}

const CONDITION_OPS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];

/// Evaluate `name` or `name <op> literal` against the variables. Anything
/// that cannot be evaluated counts as true.
pub fn evaluate_condition(condition: &str, variables: &HashMap<String, Value>) -> bool {
    let condition = condition.trim();

    let split = CONDITION_OPS
        .iter()
        .find_map(|op| condition.find(op).map(|at| (at, *op)));

    let Some((at, op)) = split else {
        return variables.get(condition).is_none_or(Value::is_truthy);
    };

    let name = condition[..at].trim();
    let literal = condition[at + op.len()..].trim();
    let Some(value) = variables.get(name) else {
        return true;
    };
    let rhs = parse_literal(literal)
        .unwrap_or_else(|| Value::Str(literal.trim_matches('"').to_string()));

    binary_op(value, &rhs, op, 0).map_or(true, |result| result.is_truthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_breakpoint_by_pc_or_line() {
        let mut state = DebugState::new();
        state.add_breakpoint(10, 3);
        let empty = HashMap::new();
        assert!(state.should_pause_at(3, 99, &empty));
        assert!(state.should_pause_at(7, 10, &empty));
        assert!(!state.should_pause_at(4, 11, &empty));

        state.disable_breakpoint(10);
        assert!(!state.should_pause_at(3, 10, &empty));
        state.enable_breakpoint(10);
        assert!(state.should_pause_at(3, 10, &empty));
    }

    #[test]
    fn test_conditional_breakpoint() {
        let mut state = DebugState::new();
        state.add_conditional_breakpoint(5, 2, "i == 3");
        assert!(!state.should_pause_at(2, 5, &vars(&[("i", Value::Int(1))])));
        assert!(state.should_pause_at(2, 5, &vars(&[("i", Value::Int(3))])));
        // Unknown variable cannot be evaluated.
        assert!(state.should_pause_at(2, 5, &HashMap::new()));
    }

    #[test]
    fn test_temporary_breakpoint_fires_once() {
        let mut state = DebugState::new();
        state.add_temporary_breakpoint(4, 1);
        state.remove_breakpoint(4);
        assert_eq!(state.breakpoints.len(), 1);
        assert!(state.should_pause_at(1, 4, &HashMap::new()));
        assert!(state.breakpoints.is_empty());
        assert!(!state.should_pause_at(1, 4, &HashMap::new()));
    }

    #[test]
    fn test_remove_by_pc() {
        let mut state = DebugState::new();
        state.add_breakpoint(1, 0);
        state.add_breakpoint(2, 1);
        state.remove_breakpoint_by_pc(0);
        assert_eq!(state.breakpoints.len(), 1);
        assert_eq!(state.breakpoints[0].line, 2);
    }

    #[test]
    fn test_step_over_waits_for_return() {
        let mut state = DebugState::new();
        let empty = HashMap::new();
        state.step_over();
        state.enter_call("f");
        assert!(!state.should_pause_at(5, 5, &empty));
        state.exit_call();
        assert!(state.should_pause_at(6, 6, &empty));
    }

    #[test]
    fn test_step_out_waits_for_shallower_depth() {
        let mut state = DebugState::new();
        let empty = HashMap::new();
        state.enter_call("f");
        state.step_out();
        assert!(!state.should_pause_at(5, 5, &empty));
        state.exit_call();
        assert!(state.should_pause_at(6, 6, &empty));
    }

    #[test]
    fn test_continue_and_break() {
        let mut state = DebugState::new();
        let empty = HashMap::new();
        state.step();
        assert!(state.should_pause_at(0, 1, &empty));
        state.continue_execution();
        assert!(!state.should_pause_at(1, 2, &empty));
        state.request_break();
        assert!(state.should_pause_at(2, 3, &empty));
        state.clear_pending();
        assert!(!state.is_active());
    }

    #[test]
    fn test_evaluate_condition() {
        let v = vars(&[("x", Value::Int(5)), ("s", Value::from("hi")), ("z", Value::Int(0))]);
        assert!(evaluate_condition("x", &v));
        assert!(!evaluate_condition("z", &v));
        assert!(evaluate_condition("x >= 5", &v));
        assert!(!evaluate_condition("x < 5", &v));
        assert!(evaluate_condition("s == \"hi\"", &v));
        assert!(evaluate_condition("s != bye", &v));
        // Type error counts as true.
        assert!(evaluate_condition("s < 3", &v));
    }
}
