//! Environment blocks of spawned debuggees.

use std::collections::BTreeMap;

use winstalk_engine::CommandEnv;

use crate::error::{Error, Result};

/// Resolves the environment of a process to spawn, given the environment of
/// the debugger.
///
/// Variable names are case-insensitive: an edit replaces an inherited
/// variable whatever its case. Variables come out sorted by name, as the OS
/// expects them.
pub(crate) fn resolve<I>(env: &CommandEnv, inherited: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars = BTreeMap::new();

    match env {
        CommandEnv::Inherit(edits) => {
            for (key, val) in inherited {
                vars.insert(key.to_uppercase(), (key, val));
            }

            for (key, val) in edits {
                match val {
                    Some(val) => {
                        vars.insert(key.to_uppercase(), (key.clone(), val.clone()));
                    }
                    None => {
                        vars.remove(&key.to_uppercase());
                    }
                }
            }
        }
        CommandEnv::NoInherit(env) => {
            for (key, val) in env {
                vars.insert(key.to_uppercase(), (key.clone(), val.clone()));
            }
        }
    }

    vars.into_values().collect()
}

/// Encodes variables into a UTF-16 environment block: `key=value` strings
/// each ended by a nul character, then a final nul character.
pub(crate) fn encode_block(vars: &[(String, String)]) -> Result<Vec<u16>> {
    let mut block = Vec::new();

    for (key, val) in vars {
        // per-drive directories are named `=C:`
        let bad_key = key.is_empty() || key.contains('\0') || key.chars().skip(1).any(|c| c == '=');

        if bad_key || val.contains('\0') {
            return Err(Error::InteriorNul("environment"));
        }

        block.extend(key.encode_utf16());
        block.push(u16::from(b'='));
        block.extend(val.encode_utf16());
        block.push(0);
    }

    // an empty block still holds two nul characters
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);

    Ok(block)
}

/// Encodes a string into a nul-terminated UTF-16 buffer.
pub(crate) fn wide(s: &str, what: &'static str) -> Result<Vec<u16>> {
    if s.contains('\0') {
        return Err(Error::InteriorNul(what));
    }

    Ok(s.encode_utf16().chain([0]).collect())
}
