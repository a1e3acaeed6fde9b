//! Body parsing: printability rules, `>>N` reference links, hash
//! commands, and board filters.
//!
//! Everything here is a pure function over runes and string buffers.
//! Link targets are resolved through a caller-supplied resolver so the
//! parser stays independent of the registry; dice rolls are seeded per
//! (post, command index) so a final parse is deterministic and repeated
//! parses agree.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::PostError;
use crate::protocol::{Command, Link};

/// Upper bound on dice per roll command.
const MAX_DICE: u32 = 10;
/// Upper bound on faces per die.
const MAX_FACES: u32 = 10000;

const EIGHT_BALL: &[&str] = &[
    "Yes",
    "No",
    "Maybe",
    "It is certain",
    "Ask again later",
    "Outlook not so good",
    "Most likely",
    "Cannot predict now",
];

/// Check a single rune against the printability rules.
///
/// NUL is always rejected; C0 controls other than tab (and newline when
/// `allow_newline`), DEL, C1 controls, and a small set of formatting
/// code points that break rendering are rejected too.
pub fn is_printable(c: char, allow_newline: bool) -> Result<(), PostError> {
    match c {
        '\0' => Err(PostError::ContainsNull),
        '\n' if allow_newline => Ok(()),
        '\t' => Ok(()),
        c if (c as u32) < 0x20 || c as u32 == 0x7f => Err(PostError::NotPrintable(c as u32)),
        c if (0x80..=0x9f).contains(&(c as u32)) => Err(PostError::NotPrintable(c as u32)),
        '\u{200b}' | '\u{202d}' | '\u{202e}' | '\u{feff}' => {
            Err(PostError::NotPrintable(c as u32))
        }
        _ => Ok(()),
    }
}

/// Check every rune in a slice.
pub fn check_printable(text: &[char], allow_newline: bool) -> Result<(), PostError> {
    for &c in text {
        is_printable(c, allow_newline)?;
    }
    Ok(())
}

/// Links and commands extracted from a post body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBody {
    pub links: Vec<Link>,
    pub commands: Vec<Command>,
}

/// Scan a body for `>>N` links and hash commands.
///
/// `resolve` maps a referenced post id to its thread; unresolved
/// references are dropped. Commands are only evaluated on the final
/// parse (post close); their results are deterministic per
/// (post, command index).
pub fn parse_body(
    body: &str,
    post_id: u64,
    resolve: &dyn Fn(u64) -> Option<u64>,
    final_parse: bool,
) -> ParsedBody {
    let mut out = ParsedBody::default();
    let mut command_index = 0u64;

    for line in body.lines() {
        for word in line.split(|c: char| c.is_whitespace()) {
            if let Some(num) = parse_link(word) {
                if let Some(op) = resolve(num) {
                    out.links.push(Link { id: num, op });
                }
            } else if final_parse {
                if let Some(cmd) = parse_command(word, post_id, command_index) {
                    out.commands.push(cmd);
                    command_index += 1;
                }
            }
        }
    }
    out
}

/// `>>123` → 123. Trailing punctuation is tolerated.
fn parse_link(word: &str) -> Option<u64> {
    let rest = word.strip_prefix(">>")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Parse one `#command` word. Results are seeded per (post, index).
fn parse_command(word: &str, post_id: u64, index: u64) -> Option<Command> {
    let rest = word.strip_prefix('#')?;
    let mut rng = command_rng(post_id, index);
    match rest {
        "flip" => Some(Command::Flip(rng.gen_bool(0.5))),
        "8ball" => {
            let pick = rng.gen_range(0..EIGHT_BALL.len());
            Some(Command::EightBall(EIGHT_BALL[pick].to_string()))
        }
        _ => parse_dice(rest, &mut rng),
    }
}

/// `XdY`: roll X dice with Y faces each. X defaults to 1.
fn parse_dice(word: &str, rng: &mut StdRng) -> Option<Command> {
    let (count_str, faces_str) = word.split_once('d')?;
    let count: u32 = if count_str.is_empty() {
        1
    } else {
        count_str.parse().ok()?
    };
    let faces: u32 = faces_str.parse().ok()?;
    if count == 0 || count > MAX_DICE || faces < 2 || faces > MAX_FACES {
        return None;
    }
    let rolls = (0..count)
        .map(|_| rng.gen_range(1..=faces) as u16)
        .collect();
    Some(Command::Dice(rolls))
}

fn command_rng(post_id: u64, index: u64) -> StdRng {
    StdRng::seed_from_u64(post_id ^ (index + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

/// Board-specific behavior hooks. The `#steal` rule and body filters
/// are board policy, not core protocol, so boards can install
/// different rules.
pub trait BoardPolicy: Send + Sync {
    /// Install a board filter from this body. Returning `true` means
    /// the message was consumed and normal parsing is skipped.
    fn register_filter(&self, _op: u64, _body: &str) -> bool {
        false
    }

    /// Rewrite the body in place per board rules. Returns whether a
    /// change was made.
    fn apply_filters(&self, _op: u64, _body: &mut String) -> bool {
        false
    }

    /// Whether `#steal` may transfer images on this board.
    fn allows_image_theft(&self) -> bool {
        false
    }
}

/// Inert policy for boards without special rules.
pub struct DefaultPolicy;

impl BoardPolicy for DefaultPolicy {}

/// Policy for boards that allow image theft via `#steal`.
pub struct TheftPolicy;

impl BoardPolicy for TheftPolicy {
    fn allows_image_theft(&self) -> bool {
        true
    }
}

/// Word substitution filter, the simplest useful body filter.
pub struct WordFilterPolicy {
    subs: Vec<(String, String)>,
}

impl WordFilterPolicy {
    pub fn new(subs: Vec<(String, String)>) -> Self {
        Self { subs }
    }
}

impl BoardPolicy for WordFilterPolicy {
    fn apply_filters(&self, _op: u64, body: &mut String) -> bool {
        let mut changed = false;
        for (from, to) in &self.subs {
            if body.contains(from.as_str()) {
                *body = body.replace(from.as_str(), to);
                changed = true;
            }
        }
        changed
    }
}
