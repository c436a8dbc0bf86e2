use chrono::Utc;
use cove_proto::CommandExecution;

/// Private OSC number used for shell prompt marks. The rc file injected
/// at spawn wraps PS1 so the shell emits `ESC ] 7770 ; <sentinel> ; A BEL`
/// right before drawing the prompt and the matching `B` mark right after,
/// where `<sentinel>` is a per-session random string.
pub const PROMPT_OSC: &str = "7770";

/// Semantic tokens produced from the raw PTY stream.
#[derive(Debug, PartialEq)]
pub enum Token {
    /// Printable text after normalization (CRLF folded to LF, control
    /// and escape sequences stripped).
    Text(String),
    /// Prompt is about to be drawn; output of the previous command ends here.
    PromptStart,
    /// Prompt has been drawn; user input begins here.
    PromptEnd,
    /// OSC 0/2 window title report.
    Title(String),
    /// OSC 7 working directory report (file:// URL already stripped to a path).
    Cwd(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Ground,
    Escape,
    EscapeDesignate,
    Csi,
    Osc,
    OscEsc,
}

/// Streaming normalizer over raw terminal bytes.
///
/// Escape sequences may be split across arbitrary chunk boundaries, so
/// partial sequences are buffered between calls. CR immediately followed
/// by LF collapses to LF; a lone CR (cursor-return tricks, spinners) is
/// dropped rather than treated as a line break.
pub struct Normalizer {
    sentinel: String,
    state: State,
    osc_buf: String,
    pending_utf8: Vec<u8>,
}

impl Normalizer {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            state: State::Ground,
            osc_buf: String::new(),
            pending_utf8: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut text = String::new();

        let mut bytes = std::mem::take(&mut self.pending_utf8);
        bytes.extend_from_slice(chunk);

        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            match self.state {
                State::Ground => match b {
                    0x1b => {
                        self.state = State::Escape;
                        i += 1;
                    }
                    b'\r' => {
                        // Collapse CRLF; drop lone CR.
                        if bytes.get(i + 1) == Some(&b'\n') {
                            text.push('\n');
                            i += 2;
                        } else if i + 1 == bytes.len() {
                            // Chunk ends on CR; decide once the next byte arrives.
                            self.pending_utf8 = vec![b'\r'];
                            i += 1;
                        } else {
                            i += 1;
                        }
                    }
                    b'\n' | b'\t' => {
                        text.push(b as char);
                        i += 1;
                    }
                    0x00..=0x1f | 0x7f => {
                        i += 1;
                    }
                    _ => {
                        let len = utf8_len(b);
                        if i + len > bytes.len() {
                            // Partial multi-byte character at the chunk edge.
                            self.pending_utf8 = bytes[i..].to_vec();
                            i = bytes.len();
                        } else {
                            match std::str::from_utf8(&bytes[i..i + len]) {
                                Ok(s) => text.push_str(s),
                                Err(_) => text.push(char::REPLACEMENT_CHARACTER),
                            }
                            i += len;
                        }
                    }
                },
                State::Escape => {
                    match b {
                        b'[' => self.state = State::Csi,
                        b']' => {
                            self.state = State::Osc;
                            self.osc_buf.clear();
                        }
                        // Charset designation and line-size sequences carry
                        // one more byte that must not leak into text.
                        b'(' | b')' | b'*' | b'+' | b'#' => {
                            self.state = State::EscapeDesignate;
                        }
                        // Single-byte sequences (keypad modes, RI, IND) and
                        // anything else we do not model: drop and return.
                        _ => self.state = State::Ground,
                    }
                    i += 1;
                }
                State::EscapeDesignate => {
                    self.state = State::Ground;
                    i += 1;
                }
                State::Csi => {
                    // Final byte of a CSI sequence is 0x40..=0x7e.
                    if (0x40..=0x7e).contains(&b) {
                        self.state = State::Ground;
                    }
                    i += 1;
                }
                State::Osc => match b {
                    0x07 => {
                        self.flush_osc(&mut text, &mut tokens);
                        self.state = State::Ground;
                        i += 1;
                    }
                    0x1b => {
                        self.state = State::OscEsc;
                        i += 1;
                    }
                    _ => {
                        self.osc_buf.push(b as char);
                        i += 1;
                    }
                },
                State::OscEsc => {
                    if b == b'\\' {
                        self.flush_osc(&mut text, &mut tokens);
                        self.state = State::Ground;
                    } else {
                        // Stray ESC inside OSC payload; keep collecting.
                        self.osc_buf.push(0x1b as char);
                        self.osc_buf.push(b as char);
                        self.state = State::Osc;
                    }
                    i += 1;
                }
            }
        }

        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }
        tokens
    }

    fn flush_osc(&mut self, text: &mut String, tokens: &mut Vec<Token>) {
        let payload = std::mem::take(&mut self.osc_buf);
        let mark_prefix = format!("{PROMPT_OSC};{};", self.sentinel);
        if let Some(kind) = payload.strip_prefix(&mark_prefix) {
            if !text.is_empty() {
                tokens.push(Token::Text(std::mem::take(text)));
            }
            match kind {
                "A" => tokens.push(Token::PromptStart),
                "B" => tokens.push(Token::PromptEnd),
                _ => {}
            }
        } else if let Some(title) = payload
            .strip_prefix("0;")
            .or_else(|| payload.strip_prefix("2;"))
        {
            if !text.is_empty() {
                tokens.push(Token::Text(std::mem::take(text)));
            }
            tokens.push(Token::Title(title.to_string()));
        } else if let Some(url) = payload.strip_prefix("7;") {
            if !text.is_empty() {
                tokens.push(Token::Text(std::mem::take(text)));
            }
            let path = url
                .strip_prefix("file://")
                .map(|rest| match rest.find('/') {
                    Some(idx) => &rest[idx..],
                    None => "/",
                })
                .unwrap_or(url);
            tokens.push(Token::Cwd(path.to_string()));
        }
        // Other OSC payloads (clipboard, hyperlinks) are dropped.
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Before the first B mark. Startup output (motd, rc file echoes)
    /// and everything on a markless shell lands here and is never
    /// mistaken for typed input.
    Inactive,
    /// Between B and the input newline.
    Input,
    /// Between the input newline and the next A mark.
    Output,
    /// Between A and B: the prompt itself is being drawn. Text here is
    /// the rendered prompt and must not be recorded.
    Prompt,
}

/// Tracks command boundaries from normalizer tokens.
///
/// Without prompt marks (a shell that ignores the injected rc file) no
/// tokens beyond `Text` ever arrive, the phase stays `Inactive`, and no
/// executions are recorded. Transport is unaffected either way.
pub struct CommandCapture {
    phase: Phase,
    input_buf: String,
    current: Option<CommandExecution>,
    last: Option<CommandExecution>,
}

impl CommandCapture {
    pub fn new() -> Self {
        Self {
            phase: Phase::Inactive,
            input_buf: String::new(),
            current: None,
            last: None,
        }
    }

    /// The most recently sealed execution, if any.
    pub fn last_execution(&self) -> Option<&CommandExecution> {
        self.last.as_ref()
    }

    /// The execution currently collecting output, if any.
    pub fn current_execution(&self) -> Option<&CommandExecution> {
        self.current.as_ref()
    }

    /// Advance the state machine. Returns the record sealed by this
    /// token, if it completed one.
    pub fn observe(&mut self, token: &Token) -> Option<CommandExecution> {
        match token {
            Token::PromptStart => {
                self.phase = Phase::Prompt;
                if let Some(mut exec) = self.current.take() {
                    exec.output = trim_trailing(&exec.output);
                    exec.completed_at = Some(Utc::now());
                    self.last = Some(exec.clone());
                    return Some(exec);
                }
            }
            Token::PromptEnd => {
                self.input_buf.clear();
                self.phase = Phase::Input;
            }
            Token::Text(text) => match self.phase {
                Phase::Inactive | Phase::Prompt => {}
                Phase::Input => {
                    let mut rest = text.as_str();
                    while let Some(idx) = rest.find('\n') {
                        self.input_buf.push_str(&rest[..idx]);
                        let input = self.input_buf.trim().to_string();
                        self.input_buf.clear();
                        self.phase = Phase::Output;
                        if !input.is_empty() {
                            self.current = Some(CommandExecution {
                                input,
                                output: String::new(),
                                started_at: Utc::now(),
                                completed_at: None,
                            });
                        }
                        rest = &rest[idx + 1..];
                        // Anything after the newline is command output.
                        if let Some(exec) = self.current.as_mut() {
                            exec.output.push_str(rest);
                        }
                        return None;
                    }
                    self.input_buf.push_str(rest);
                }
                Phase::Output => {
                    if let Some(exec) = self.current.as_mut() {
                        exec.output.push_str(text);
                    }
                }
            },
            Token::Title(_) | Token::Cwd(_) => {}
        }
        None
    }
}

fn trim_trailing(s: &str) -> String {
    s.trim_end().to_string()
}
