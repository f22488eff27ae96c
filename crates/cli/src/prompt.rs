use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use flotilla_core::error::Result;

/// Asks the operator a yes/no question before a destructive action.
pub trait Confirm: Send + Sync {
    /// Show `message` and report whether the answer was exactly `y`.
    fn confirm(&self, message: &str) -> Result<bool>;
}

/// Whether a raw answer line accepts the prompt. Only a bare `y` does.
pub fn accepts(answer: &str) -> bool {
    answer.trim_end_matches(['\r', '\n']) == "y"
}

/// Reads the answer from the controlling terminal's stdin.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, message: &str) -> Result<bool> {
        print!("{}", message);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().lock().read_line(&mut input)?;
        Ok(accepts(&input))
    }
}

/// Replays canned answers in order; used by tests and automation.
#[derive(Default)]
pub struct ScriptedConfirm {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedConfirm {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedConfirm {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt shown so far.
    pub fn asked(&self) -> Vec<String> {
        match self.asked.lock() {
            Ok(asked) => asked.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, message: &str) -> Result<bool> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(message.to_string());
        }
        // An exhausted script answers like an empty line.
        let answer = match self.answers.lock() {
            Ok(mut answers) => answers.pop_front().unwrap_or_default(),
            Err(_) => String::new(),
        };
        Ok(accepts(&answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_bare_y_accepts() {
        assert!(accepts("y\n"));
        assert!(accepts("y\r\n"));
        assert!(!accepts("Y\n"));
        assert!(!accepts("yes\n"));
        assert!(!accepts(" y\n"));
        assert!(!accepts("\n"));
        assert!(!accepts(""));
    }

    #[test]
    fn scripted_answers_replay_in_order() {
        let confirm = ScriptedConfirm::new(["y", "n"]);
        assert!(confirm.confirm("first? ").unwrap());
        assert!(!confirm.confirm("second? ").unwrap());
        assert!(!confirm.confirm("third? ").unwrap());
        assert_eq!(confirm.asked().len(), 3);
    }
}
