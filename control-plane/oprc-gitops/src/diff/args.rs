use std::collections::{HashMap, HashSet};

#[derive(Debug, PartialEq, Eq)]
enum Arg<'a> {
    Flag(&'a str, Option<&'a str>),
    Positional(&'a str),
}

fn is_flag(s: &str) -> bool {
    s.starts_with("--")
}

/// Split an argv into flags (with their optional value) and positionals.
/// A token following a flag is its value unless it is itself a flag.
fn tokens(args: &[String]) -> Vec<Arg<'_>> {
    let mut out = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if is_flag(arg) {
            let value = iter.next_if(|next| !is_flag(next)).map(String::as_str);
            out.push(Arg::Flag(arg, value));
        } else {
            out.push(Arg::Positional(arg));
        }
    }
    out
}

fn push(result: &mut Vec<String>, flag: &str, value: Option<&str>) {
    result.push(flag.to_string());
    if let Some(v) = value {
        result.push(v.to_string());
    }
}

fn remove_flag(result: &mut Vec<String>, flag: &str) {
    let mut kept = Vec::with_capacity(result.len());
    let mut iter = result.drain(..).peekable();
    while let Some(arg) = iter.next() {
        if arg == flag {
            iter.next_if(|next| !is_flag(next));
            continue;
        }
        kept.push(arg);
    }
    drop(iter);
    *result = kept;
}

/// Merge `extra` into the command line `base`.
///
/// Flags present in `base` are single-valued: an override in `extra`
/// replaces the flag and its value in place of appending a duplicate.
/// Flags only in `extra` may repeat with distinct values. An exact
/// flag/value pair already present is skipped.
pub fn append_unique_args(base: &[String], extra: &[String]) -> Vec<String> {
    let mut result = Vec::with_capacity(base.len() + extra.len());
    let mut seen: HashMap<&str, HashSet<Option<&str>>> = HashMap::new();
    let mut single_valued: HashSet<&str> = HashSet::new();

    for arg in tokens(base) {
        match arg {
            Arg::Flag(flag, value) => {
                seen.entry(flag).or_default().insert(value);
                single_valued.insert(flag);
                push(&mut result, flag, value);
            }
            Arg::Positional(p) => result.push(p.to_string()),
        }
    }

    for arg in tokens(extra) {
        match arg {
            Arg::Flag(flag, value) => {
                if seen.get(flag).is_some_and(|vals| vals.contains(&value)) {
                    continue;
                }
                if single_valued.contains(flag) {
                    remove_flag(&mut result, flag);
                    seen.insert(flag, HashSet::from([value]));
                } else {
                    seen.entry(flag).or_default().insert(value);
                }
                push(&mut result, flag, value);
            }
            Arg::Positional(p) => result.push(p.to_string()),
        }
    }

    result
}
