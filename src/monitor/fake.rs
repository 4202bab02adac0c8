//! Scripted in-memory monitor for tests.

use super::Monitor;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use vmplug_qmp::Event;

#[derive(Debug, Clone)]
enum Reply {
    Ok(Value),
    Err { class: String, desc: String },
}

#[derive(Debug)]
struct Rule {
    /// Command name, or `hmp <verb>` for line commands.
    command: String,
    /// Argument fields that must match.
    when: Option<Value>,
    /// Replies in order; the last one repeats.
    replies: VecDeque<Reply>,
    /// Whether the last reply has been served at least once.
    repeating: bool,
}

/// Answers commands from rules and records every call.
///
/// Unscripted commands succeed with `{}` (or empty output for line
/// commands). Events queued with [`ScriptedMonitor::emit_after`] are
/// broadcast when the named command runs, before it replies.
pub(crate) struct ScriptedMonitor {
    rules: Mutex<Vec<Rule>>,
    emits: Mutex<Vec<(String, VecDeque<Vec<Event>>)>>,
    calls: Mutex<Vec<(String, Option<Value>)>>,
    events: broadcast::Sender<Event>,
}

fn args_match(when: &Option<Value>, args: &Option<Value>) -> bool {
    let Some(Value::Object(want)) = when else {
        return true;
    };
    let Some(args) = args else {
        return false;
    };
    want.iter().all(|(k, v)| args.get(k) == Some(v))
}

impl ScriptedMonitor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            rules: Mutex::new(Vec::new()),
            emits: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            events,
        }
    }

    fn push(&self, command: &str, when: Option<Value>, reply: Reply) {
        let mut rules = self.rules.lock();
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.command == command && r.when == when)
        {
            if rule.repeating {
                rule.replies.clear();
                rule.repeating = false;
            }
            rule.replies.push_back(reply);
            return;
        }
        rules.push(Rule {
            command: command.to_string(),
            when,
            replies: VecDeque::from([reply]),
            repeating: false,
        });
    }

    /// Queue a successful reply.
    pub fn reply(&self, command: &str, value: Value) {
        self.push(command, None, Reply::Ok(value));
    }

    /// Queue a successful reply for calls whose arguments contain `when`.
    pub fn reply_when(&self, command: &str, when: Value, value: Value) {
        self.push(command, Some(when), Reply::Ok(value));
    }

    /// Queue an error reply.
    pub fn fail(&self, command: &str, class: &str, desc: &str) {
        self.push(
            command,
            None,
            Reply::Err {
                class: class.to_string(),
                desc: desc.to_string(),
            },
        );
    }

    /// Queue an error reply for calls whose arguments contain `when`.
    pub fn fail_when(&self, command: &str, when: Value, class: &str, desc: &str) {
        self.push(
            command,
            Some(when),
            Reply::Err {
                class: class.to_string(),
                desc: desc.to_string(),
            },
        );
    }

    /// Drop every scripted reply for `command`.
    pub fn forget(&self, command: &str) {
        self.rules.lock().retain(|r| r.command != command);
    }

    /// Broadcast `events` the next time `command` runs.
    pub fn emit_after(&self, command: &str, events: Vec<Value>) {
        let events = events
            .into_iter()
            .map(|e| serde_json::from_value(e).unwrap())
            .collect();
        let mut emits = self.emits.lock();
        match emits.iter_mut().find(|(c, _)| c == command) {
            Some((_, queue)) => queue.push_back(events),
            None => emits.push((command.to_string(), VecDeque::from([events]))),
        }
    }

    /// Every command name (line commands as `hmp <line>`), in call order.
    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    /// Arguments of every call to `command`.
    pub fn args_of(&self, command: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(c, _)| c == command)
            .map(|(_, a)| a.clone().unwrap_or(Value::Null))
            .collect()
    }

    fn answer(&self, key: &str, recorded: String, args: Option<Value>, default: Value) -> Result<Value> {
        self.calls.lock().push((recorded, args.clone()));

        let batch = self
            .emits
            .lock()
            .iter_mut()
            .find(|(c, _)| c == key)
            .and_then(|(_, q)| q.pop_front());
        for event in batch.into_iter().flatten() {
            let _ = self.events.send(event);
        }

        let reply = {
            let mut rules = self.rules.lock();
            let rule = rules
                .iter_mut()
                .rev()
                .find(|r| r.command == key && args_match(&r.when, &args));
            match rule {
                Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front(),
                Some(rule) => {
                    rule.repeating = true;
                    rule.replies.front().cloned()
                }
                None => None,
            }
        };
        match reply.unwrap_or(Reply::Ok(default)) {
            Reply::Ok(value) => Ok(value),
            Reply::Err { class, desc } => Err(Error::Monitor {
                command: key.to_string(),
                class,
                desc,
            }),
        }
    }
}

#[async_trait]
impl Monitor for ScriptedMonitor {
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.answer(command, command.to_string(), arguments, json!({}))
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn human(&self, line: &str) -> Result<String> {
        let verb = line.split_whitespace().next().unwrap_or_default();
        let key = format!("hmp {}", verb);
        let output = self.answer(&key, format!("hmp {}", line), None, json!(""))?;
        Ok(output.as_str().unwrap_or_default().trim().to_string())
    }
}
