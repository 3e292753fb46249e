use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::value::Value;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Services a script reaches only by instruction name. Every call blocks
/// the VM until it returns.
pub trait Host {
    fn version(&self) -> String {
        VERSION.to_string()
    }

    fn print_line(&mut self, line: &str);

    fn env_var(&self, key: &str) -> Option<String>;
    fn set_env_var(&mut self, key: &str, value: &str);
    fn remove_env_var(&mut self, key: &str);

    /// Run a command and return its combined output, or an `Error` value.
    fn system_cmd(&mut self, cmd: &str, args: &[String]) -> Value;

    fn clipboard_text(&mut self) -> String;
    fn set_clipboard_text(&mut self, text: &str);

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The real process: stdout, environment, shell.
#[derive(Debug, Default)]
pub struct SystemHost {
    clipboard: String,
}

impl SystemHost {
    pub fn new() -> Self {
        SystemHost::default()
    }
}

impl Host for SystemHost {
    fn print_line(&mut self, line: &str) {
        println!("{}", line);
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set_env_var(&mut self, key: &str, value: &str) {
        // SAFETY: the VM is single-threaded and owns the process environment
        // for the duration of a run.
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env_var(&mut self, key: &str) {
        // SAFETY: see set_env_var.
        unsafe { std::env::remove_var(key) }
    }

    fn system_cmd(&mut self, cmd: &str, args: &[String]) -> Value {
        match std::process::Command::new(cmd).args(args).output() {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                Value::Str(text)
            }
            Err(e) => Value::Error(format!("failed to run {}: {}", cmd, e)),
        }
    }

    fn clipboard_text(&mut self) -> String {
        self.clipboard.clone()
    }

    fn set_clipboard_text(&mut self, text: &str) {
        self.clipboard = text.to_string();
    }
}

/// In-memory host: printed lines are recorded, environment and clipboard
/// never touch the process. Clones share the same output buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferHost {
    lines: Rc<RefCell<Vec<String>>>,
    env: BTreeMap<String, String>,
    clipboard: String,
    slept: Duration,
}

impl BufferHost {
    pub fn new() -> Self {
        BufferHost::default()
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    pub fn output(&self) -> String {
        self.lines.borrow().join("\n")
    }
}

impl Host for BufferHost {
    fn print_line(&mut self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }

    fn env_var(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn set_env_var(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    fn remove_env_var(&mut self, key: &str) {
        self.env.remove(key);
    }

    fn system_cmd(&mut self, cmd: &str, args: &[String]) -> Value {
        Value::Error(format!("system commands are disabled: {} {}", cmd, args.join(" ")))
    }

    fn clipboard_text(&mut self) -> String {
        self.clipboard.clone()
    }

    fn set_clipboard_text(&mut self, text: &str) {
        self.clipboard = text.to_string();
    }

    fn sleep(&mut self, duration: Duration) {
        self.slept += duration;
    }
}
