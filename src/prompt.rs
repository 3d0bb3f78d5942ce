//! Secret prompts.
//!
//! Secrets are read key by key in raw mode so nothing is echoed. When
//! stdin is not a terminal the line is read as-is, which keeps piped
//! input working.

use std::io::{self, BufRead, IsTerminal, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::warn;
use zeroize::Zeroizing;

/// Outcome of feeding one key to a secret being typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretInput {
    /// Keep reading.
    Pending,
    /// Enter pressed; the secret is complete.
    Submit,
    /// Ctrl-C or Esc pressed.
    Cancel,
}

/// Applies one key event to the secret typed so far.
pub fn apply_secret_key(secret: &mut String, key: &KeyEvent) -> SecretInput {
    if key.kind == KeyEventKind::Release {
        return SecretInput::Pending;
    }

    match (key.modifiers, key.code) {
        (KeyModifiers::CONTROL, KeyCode::Char('c' | 'd')) | (_, KeyCode::Esc) => {
            SecretInput::Cancel
        }
        (_, KeyCode::Enter) => SecretInput::Submit,
        (_, KeyCode::Backspace) => {
            secret.pop();
            SecretInput::Pending
        }
        (KeyModifiers::NONE | KeyModifiers::SHIFT, KeyCode::Char(c)) => {
            secret.push(c);
            SecretInput::Pending
        }
        _ => SecretInput::Pending,
    }
}

/// Prints `label` to stderr and reads a secret without echo.
pub fn read_secret(label: &str) -> io::Result<Zeroizing<String>> {
    eprint!("{}", label);
    io::stderr().flush()?;

    if !io::stdin().is_terminal() {
        let mut line = Zeroizing::new(String::new());
        io::stdin().lock().read_line(&mut line)?;
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        return Ok(line);
    }

    enable_raw_mode()?;
    let result = read_keys();
    if let Err(e) = disable_raw_mode() {
        warn!("Failed to disable raw mode: {}", e);
    }
    eprintln!();
    result
}

fn read_keys() -> io::Result<Zeroizing<String>> {
    let mut secret = Zeroizing::new(String::new());
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        match apply_secret_key(&mut secret, &key) {
            SecretInput::Pending => {}
            SecretInput::Submit => return Ok(secret),
            SecretInput::Cancel => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "prompt cancelled"));
            }
        }
    }
}
