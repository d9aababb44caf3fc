//! Interactive terminal debugger.
//!
//! Drives [`VirtualMachine::execute_debug`] and the breakpoint overlay from a
//! ratatui front end. Program output is captured and shown in its own pane.

use std::io;
use std::path::Path;

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};

use crate::config::RuntimeConfig;
use crate::vm::{DebugEvent, SharedOutput, VirtualMachine};

const HELP: &str = "Commands: s(tep) n(ext) i(nto) o(ut) c(ontinue) b <line> [cond] d <line> \
en <line> dis <line> bl p <var> vars stack bt q(uit)";

pub struct Debugger {
    vm: VirtualMachine,
    output: SharedOutput,
    /// IR source lines
    source_lines: Vec<String>,
    /// Line of the instruction about to run, while paused
    paused_line: Option<usize>,
    /// Whether the TUI loop is running
    running: bool,
    /// Whether the program has ended
    finished: bool,
    input: String,
    status: String,
}

impl Debugger {
    pub fn new(path: &Path, config: RuntimeConfig) -> Result<Self, String> {
        let source =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read file: {}", e))?;
        Self::from_source(&source, config)
    }

    /// Build a debugger over IR text. `INPUT` reads empty lines.
    pub fn from_source(source: &str, config: RuntimeConfig) -> Result<Self, String> {
        let output = SharedOutput::new();
        let mut vm = VirtualMachine::with_io(config, Box::new(io::empty()), Box::new(output.clone()));
        vm.load_source(source).map_err(|e| e.to_string())?;

        Ok(Self {
            vm,
            output,
            source_lines: source.lines().map(|s| s.to_string()).collect(),
            paused_line: None,
            running: true,
            finished: false,
            input: String::new(),
            status: "Ready. Type 'h' for help.".to_string(),
        })
    }

    pub fn set_breakpoint(&mut self, line: usize, condition: Option<&str>) {
        self.vm.add_breakpoint_at_line(line, condition);
        self.status = match condition {
            Some(cond) => format!("Breakpoint set at line {} if {}", line, cond),
            None => format!("Breakpoint set at line {}", line),
        };
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn paused_line(&self) -> Option<usize> {
        self.paused_line
    }

    pub fn output(&self) -> String {
        self.output.text()
    }

    /// Run until the next pause or the end of the program.
    fn resume(&mut self) {
        if self.finished {
            self.status = "Program has ended.".to_string();
            return;
        }
        match self.vm.execute_debug() {
            Ok(DebugEvent::Paused { pc, line }) => {
                self.paused_line = Some(line);
                self.status = format!("Paused at line {} (pc {})", line, pc);
            }
            Ok(DebugEvent::Halted) => {
                self.paused_line = None;
                self.finished = true;
                self.status = "Program finished.".to_string();
            }
            Err(e) => {
                self.paused_line = None;
                self.finished = true;
                self.status = e.to_string();
            }
        }
    }

    fn line_arg(&mut self, parts: &[&str], usage: &str) -> Option<usize> {
        let line = parts.get(1).and_then(|s| s.parse::<usize>().ok());
        if line.is_none() {
            self.status = format!("Usage: {}", usage);
        }
        line
    }

    /// Apply one command line to the debugger.
    pub fn process_command(&mut self, cmd: &str) {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        let Some(&head) = parts.first() else {
            return;
        };

        match head {
            "s" | "step" => {
                self.vm.debug_mut().step();
                self.resume();
            }
            "n" | "next" => {
                self.vm.debug_mut().step_over();
                self.resume();
            }
            "i" | "into" => {
                self.vm.debug_mut().step_into();
                self.resume();
            }
            "o" | "out" => {
                self.vm.debug_mut().step_out();
                self.resume();
            }
            "c" | "continue" => {
                self.vm.debug_mut().continue_execution();
                self.resume();
            }
            "b" => {
                if let Some(line) = self.line_arg(&parts, "b <line> [condition]") {
                    let condition = parts[2..].join(" ");
                    let condition = (!condition.is_empty()).then_some(condition.as_str());
                    self.set_breakpoint(line, condition);
                }
            }
            "d" => {
                if let Some(line) = self.line_arg(&parts, "d <line>") {
                    self.vm.debug_mut().remove_breakpoint(line);
                    self.status = format!("Breakpoint deleted at line {}", line);
                }
            }
            "en" => {
                if let Some(line) = self.line_arg(&parts, "en <line>") {
                    self.vm.debug_mut().enable_breakpoint(line);
                    self.status = format!("Breakpoint enabled at line {}", line);
                }
            }
            "dis" => {
                if let Some(line) = self.line_arg(&parts, "dis <line>") {
                    self.vm.debug_mut().disable_breakpoint(line);
                    self.status = format!("Breakpoint disabled at line {}", line);
                }
            }
            "bl" => {
                let bps: Vec<String> = self
                    .vm
                    .debug()
                    .breakpoints
                    .iter()
                    .map(|bp| {
                        let mut text = bp.line.to_string();
                        if !bp.enabled {
                            text.push_str(" (disabled)");
                        }
                        if let Some(cond) = &bp.condition {
                            text.push_str(&format!(" if {}", cond));
                        }
                        text
                    })
                    .collect();
                self.status = format!("Breakpoints: {}", bps.join(", "));
            }
            "p" => match parts.get(1) {
                Some(name) => {
                    self.status = match self.vm.state().variables.get(*name) {
                        Some(value) => format!("{} = {}", name, value),
                        None => format!("Undefined variable: {}", name),
                    };
                }
                None => self.status = "Usage: p <var>".to_string(),
            },
            "vars" => {
                let mut vars: Vec<String> = self
                    .vm
                    .state()
                    .variables
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                vars.sort();
                self.status = format!("Variables: {}", vars.join(" "));
            }
            "stack" => {
                let items: Vec<String> =
                    self.vm.state().stack.iter().map(|v| v.to_string()).collect();
                self.status = format!("Stack: [{}]", items.join(", "));
            }
            "bt" | "backtrace" => {
                let mut frames = vec!["__main__".to_string()];
                frames.extend(self.vm.debug().call_stack.iter().cloned());
                self.status = format!("Calls: {}", frames.join(" -> "));
            }
            "q" | "quit" => self.running = false,
            "h" | "help" => self.status = HELP.to_string(),
            _ => self.status = format!("Unknown command: {}", head),
        }
    }

    pub fn run(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        stdout.execute(EnterAlternateScreen)?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        while self.running {
            terminal.draw(|frame| self.ui(frame))?;

            if let Event::Key(key) = event::read()?
                && key.kind == KeyEventKind::Press
            {
                match key.code {
                    KeyCode::Enter => {
                        let cmd = std::mem::take(&mut self.input);
                        self.process_command(&cmd);
                    }
                    KeyCode::Char(c) => self.input.push(c),
                    KeyCode::Backspace => {
                        self.input.pop();
                    }
                    KeyCode::Esc => self.running = false,
                    _ => {}
                }
            }
        }

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        Ok(())
    }

    fn ui(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(10),   // Source
                Constraint::Length(8), // Variables + Stack
                Constraint::Length(5), // Output
                Constraint::Length(3), // Status
                Constraint::Length(3), // Input
            ])
            .split(frame.area());

        let breakpoints = &self.vm.debug().breakpoints;
        let source_items: Vec<ListItem> = self
            .source_lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let line_num = i + 1;
                let prefix = match breakpoints.iter().find(|bp| bp.line == line_num) {
                    Some(bp) if bp.enabled => "●",
                    Some(_) => "○",
                    None => " ",
                };
                let current = self.paused_line == Some(line_num);
                let marker = if current { "▶" } else { " " };
                let content = format!("{}{}{:4} │ {}", prefix, marker, line_num, line);
                let style = if current {
                    Style::default().bg(Color::DarkGray)
                } else {
                    Style::default()
                };
                ListItem::new(content).style(style)
            })
            .collect();
        let source =
            List::new(source_items).block(Block::default().title("Source").borders(Borders::ALL));
        frame.render_widget(source, chunks[0]);

        let info_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[1]);

        let mut vars: Vec<String> = self
            .vm
            .state()
            .variables
            .iter()
            .map(|(k, v)| format!("{} = {}", k, v))
            .collect();
        vars.sort();
        let variables = Paragraph::new(vars.join("\n"))
            .block(Block::default().title("Variables").borders(Borders::ALL));
        frame.render_widget(variables, info_chunks[0]);

        let stack_text: Vec<String> = self
            .vm
            .state()
            .stack
            .iter()
            .rev()
            .take(6)
            .map(|v| v.to_string())
            .collect();
        let stack = Paragraph::new(stack_text.join("\n"))
            .block(Block::default().title("Stack").borders(Borders::ALL));
        frame.render_widget(stack, info_chunks[1]);

        let text = self.output.text();
        let lines: Vec<&str> = text.lines().collect();
        let tail = lines[lines.len().saturating_sub(3)..].join("\n");
        let output =
            Paragraph::new(tail).block(Block::default().title("Output").borders(Borders::ALL));
        frame.render_widget(output, chunks[2]);

        let status = Paragraph::new(self.status.as_str())
            .block(Block::default().title("Status").borders(Borders::ALL));
        frame.render_widget(status, chunks[3]);

        let input = Paragraph::new(format!("(debug) {}", self.input))
            .block(Block::default().title("Command").borders(Borders::ALL));
        frame.render_widget(input, chunks[4]);
    }
}

/// Open the TUI on an IR file with the given initial breakpoints.
pub fn run_debugger(path: &Path, config: RuntimeConfig, breaks: &[usize]) -> Result<(), String> {
    let mut debugger = Debugger::new(path, config)?;
    for line in breaks {
        debugger.set_breakpoint(*line, None);
    }
    debugger.run().map_err(|e| e.to_string())
}
