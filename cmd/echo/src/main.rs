//! edrt Key Echo
//!
//! Puts the terminal in raw mode and echoes every key press:
//!   terminal → AsyncReader → decode → EventHandler (main thread) → AsyncWriter
//!
//! Every tenth key a small statistics job runs on the WorkerPool; its result
//! comes back through the completion queue and is printed from the main
//! thread.
//!
//! Usage:
//!     cargo build --release -p edrt-echo
//!     ./target/release/echo
//!
//! Press `q` (or Ctrl-C / Ctrl-D) to quit.
//!
//! Environment: every `EDRT_*` variable of `RuntimeConfig::from_env()`, plus
//! `EDRT_PRINT_CONFIG=1` to dump the configuration at startup.

use std::collections::HashMap;
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, Weak};

use edrt::{kdebug, kerror, Key, Runtime, RuntimeConfig};
use nix::sys::termios::{self, SetArg, Termios};

const KEY_UP: u32 = 0x101;
const KEY_DOWN: u32 = 0x102;
const KEY_RIGHT: u32 = 0x103;
const KEY_LEFT: u32 = 0x104;
const KEY_ESC: u32 = 0x1b;
const CTRL_C: u32 = 0x03;
const CTRL_D: u32 = 0x04;

/// Terminal settings to put back on exit
static SAVED_TERMIOS: Mutex<Option<Termios>> = Mutex::new(None);

fn enable_raw_mode() {
    let stdin = std::io::stdin();
    let Ok(saved) = termios::tcgetattr(stdin.as_fd()) else {
        kdebug!("stdin is not a terminal; staying in cooked mode");
        return;
    };
    let mut raw = saved.clone();
    termios::cfmakeraw(&mut raw);
    if termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw).is_ok() {
        *SAVED_TERMIOS.lock().unwrap_or_else(|e| e.into_inner()) = Some(saved);
    }
}

fn restore_terminal() {
    let saved = SAVED_TERMIOS.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(saved) = saved {
        let _ = termios::tcsetattr(std::io::stdin().as_fd(), SetArg::TCSANOW, &saved);
    }
}

fn on_fatal(msg: &str) {
    restore_terminal();
    eprintln!("echo: fatal: {}", msg);
    std::process::exit(1);
}

fn arrow(c: u8) -> Option<u32> {
    match c {
        b'A' => Some(KEY_UP),
        b'B' => Some(KEY_DOWN),
        b'C' => Some(KEY_RIGHT),
        b'D' => Some(KEY_LEFT),
        _ => None,
    }
}

/// Minimal xterm decoder: arrows (with shift), escape, UTF-8 characters
fn decode(bytes: &[u8]) -> Option<Key> {
    match bytes {
        [] => None,
        [0x1b, b'[', b'1', b';', b'2', c] => arrow(*c).map(|code| Key::new(code, true)),
        [0x1b, b'[', c] => arrow(*c).map(|code| Key::new(code, false)),
        [0x1b] => Some(Key::new(KEY_ESC, false)),
        _ => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.chars().next())
            .map(|c| Key::new(c as u32, c.is_uppercase())),
    }
}

fn describe(key: Key) -> String {
    let name = match key.code {
        KEY_UP => "Up".to_string(),
        KEY_DOWN => "Down".to_string(),
        KEY_RIGHT => "Right".to_string(),
        KEY_LEFT => "Left".to_string(),
        KEY_ESC => "Esc".to_string(),
        c if c < 0x20 => format!("Ctrl-{}", (c as u8 + b'@') as char),
        c => char::from_u32(c).map(String::from).unwrap_or_else(|| format!("U+{:04X}", c)),
    };
    if key.shift {
        format!("Shift-{}", name)
    } else {
        name
    }
}

/// The ten most recent keys, most frequent first
fn summarize(keys: Vec<Key>) -> String {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for key in &keys {
        *counts.entry(key.code).or_default() += 1;
    }
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .iter()
        .map(|(code, n)| format!("{}x{}", describe(Key::new(*code, false)), n))
        .collect::<Vec<_>>()
        .join(" ")
}

fn on_key(rt: Weak<Runtime>) -> impl FnMut(Key) + Send + 'static {
    let mut recent = Vec::with_capacity(10);
    let mut total = 0usize;
    move |key| {
        let Some(rt) = rt.upgrade() else { return };
        total += 1;
        let _ = rt.stdout().printf(format_args!("{:>4}  {}\r\n", total, describe(key)));

        if matches!(key.code, CTRL_C | CTRL_D) || key.code == 'q' as u32 {
            rt.stop(0);
            return;
        }

        recent.push(key);
        if recent.len() == 10 {
            let batch = std::mem::take(&mut recent);
            let weak = Arc::downgrade(&rt);
            let queued = rt.pool().enqueue(
                move || summarize(batch),
                move |summary| {
                    if let Some(rt) = weak.upgrade() {
                        let _ = rt.stdout().printf(format_args!("      last 10: {}\r\n", summary));
                        let _ = rt.stdout().flush();
                    }
                },
            );
            if let Err(e) = queued {
                kdebug!("stats job not queued: {}", e);
            }
        }
    }
}

fn main() {
    edrt::init_logging();
    let config = RuntimeConfig::from_env();
    if edrt::env_get_bool("EDRT_PRINT_CONFIG", false) {
        config.print();
    }

    edrt::set_fatal_error_callback(on_fatal);
    enable_raw_mode();

    let rt = match Runtime::new(config) {
        Ok(rt) => Arc::new(rt),
        Err(e) => {
            restore_terminal();
            eprintln!("echo: {}", e);
            std::process::exit(1);
        }
    };

    let input = match std::io::stdin().as_fd().try_clone_to_owned() {
        Ok(fd) => fd,
        Err(e) => {
            edrt::fatal(&format!("cannot duplicate stdin: {}", e));
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.attach_input(input, decode, on_key(Arc::downgrade(&rt))) {
        edrt::fatal(&format!("cannot start terminal reader: {}", e));
        std::process::exit(1);
    }

    let _ = rt.stdout().write(b"edrt echo: press keys, q to quit\r\n");
    let status = rt.run().unwrap_or_else(|e| {
        kerror!("event loop failed: {}", e);
        1
    });

    rt.shutdown();
    restore_terminal();
    std::process::exit(status);
}
