//! Compiles probe argument expressions into tracefs fetch syntax.
//!
//! An expression is a whitespace-separated list of tokens, each of
//! which resolves to a signed byte offset:
//!
//! - a dotted field path, resolved through BTF (`cred.uid`)
//! - a signed 32-bit integer literal (`0`, `8`)
//! - `(a+b)` / `(a-b)` over two such tokens
//!
//! Tokens fold left to right from the base register, every step
//! wrapping the accumulator in one more dereference: `a b c` over
//! `%di` becomes `+c(+b(+a(%di)))` with each token replaced by its
//! offset. The kernel dereferences the inner levels as pointers and
//! applies the argument type to the outermost one.

use arrayvec::ArrayVec;

use super::{Kprobe, KprobeArg};
use crate::btf::BtfTable;
use crate::error::{Error, Result};

const MAX_TOKENS: usize = 128;

// Registers the kernel accepts in fetch args on x86-64.
const REGS: &[&str] = &[
    "ax", "bx", "cx", "dx", "si", "di", "bp", "sp", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "ip",
];

fn bad(expr: &str, reason: &'static str) -> Error {
    Error::BadExpr {
        expr: expr.to_string(),
        reason,
    }
}

/// Resolves one token to its signed byte offset.
fn token_offset(table: &BtfTable, exp: &str) -> Result<i64> {
    if let Some(inner) = exp.strip_prefix('(') {
        let (lhs, rest, sub) = match inner.split_once('+') {
            Some((a, b)) => (a, b, false),
            None => match inner.split_once('-') {
                Some((a, b)) => (a, b, true),
                None => return Err(bad(exp, "expected (a+b) or (a-b)")),
            },
        };
        let rhs = rest
            .split_once(')')
            .ok_or_else(|| bad(exp, "unbalanced parenthesis"))?
            .0;
        let a = token_offset(table, lhs)?;
        let b = token_offset(table, rhs)?;
        return Ok(if sub { a - b } else { a + b });
    }

    if let Ok(n) = exp.parse::<i32>() {
        return Ok(n as i64);
    }

    table
        .offset(exp)
        .map(|off| off as i64)
        .ok_or_else(|| bad(exp, "unresolved field"))
}

/// Compiles one argument into its `name=+o1(+o2(..(%reg)..)):type`
/// form. Interior offsets may be negative (container-of folds);
/// a negative outermost offset is refused since tracefs will not
/// install it.
pub(crate) fn compile_arg(table: &BtfTable, arg: &KprobeArg) -> Result<String> {
    if !REGS.contains(&arg.reg) {
        return Err(bad(arg.reg, "unknown register"));
    }

    let mut tokens = ArrayVec::<&str, MAX_TOKENS>::new();
    for tok in arg.dsl.split_whitespace() {
        tokens
            .try_push(tok)
            .map_err(|_| bad(&arg.dsl, "too many tokens"))?;
    }

    let mut fetch = format!("%{}", arg.reg);
    let mut top = 0i64;
    for &tok in &tokens {
        top = token_offset(table, tok)?;
        fetch = format!("+{}({})", top, fetch);
    }
    if top < 0 {
        return Err(bad(&arg.dsl, "negative outermost offset"));
    }

    Ok(format!("{}={}:{}", arg.name, fetch, arg.typ))
}

/// The full `kprobe_events` line for one probe under `name`:
/// `p:name target arg…` for entry probes, `r:` for return probes.
pub(crate) fn build_probe_line(table: &BtfTable, name: &str, probe: &Kprobe) -> Result<String> {
    let mut line = format!(
        "{}:{} {}",
        if probe.is_kret { 'r' } else { 'p' },
        name,
        probe.target
    );
    for arg in &probe.args {
        line.push(' ');
        line.push_str(&compile_arg(table, arg)?);
    }
    Ok(line)
}
