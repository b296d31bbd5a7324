use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the function a run enters first.
pub const ENTRY_FUNC: &str = "main";

/// One executable statement of the script language.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Stmt {
    Pass,
    Print { text: String },
    Sleep { ms: u64 },
    Call { func: String },
    SpawnThread { func: String },
    SpawnTask { func: String },
    Raise { message: String },
}

/// A statement together with its 1-based source line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtLine {
    pub line: u32,
    pub stmt: Stmt,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub def_line: u32,
    pub body: Vec<StmtLine>,
}

/// A parsed script unit. `name` doubles as the module and file name carried
/// by every frame the interpreter creates for this program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub funcs: HashMap<String, Func>,
}

impl Program {
    pub fn entry(&self) -> &Func {
        // Presence checked at parse time.
        &self.funcs[ENTRY_FUNC]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("line {line}: unknown statement: {text}")]
    UnknownStatement { line: u32, text: String },

    #[error("line {line}: bad argument for {stmt}: {text}")]
    BadArgument {
        line: u32,
        stmt: &'static str,
        text: String,
    },

    #[error("line {line}: statement outside any def")]
    StrayStatement { line: u32 },

    #[error("line {line}: def inside def")]
    NestedDef { line: u32 },

    #[error("def {name} is not terminated by end")]
    UnterminatedDef { name: String },

    #[error("line {line}: duplicate def {name}")]
    DuplicateDef { name: String, line: u32 },

    #[error("line {line}: call of unknown function {name}")]
    UnknownFunction { name: String, line: u32 },

    #[error("no `def {ENTRY_FUNC}` in script")]
    MissingEntry,
}

/// Parse a script source into a program. Line numbers are 1-based positions
/// in `source`; blank lines and `#` comments are skipped but still counted.
pub fn parse(name: impl Into<String>, source: &str) -> Result<Program, ScriptError> {
    let mut funcs: HashMap<String, Func> = HashMap::new();
    let mut current: Option<Func> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line = (idx + 1) as u32;
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (text, ""),
        };

        match head {
            "def" => {
                if current.is_some() {
                    return Err(ScriptError::NestedDef { line });
                }
                if rest.is_empty() || rest.contains(char::is_whitespace) {
                    return Err(ScriptError::BadArgument {
                        line,
                        stmt: "def",
                        text: rest.to_string(),
                    });
                }
                if funcs.contains_key(rest) {
                    return Err(ScriptError::DuplicateDef {
                        name: rest.to_string(),
                        line,
                    });
                }
                current = Some(Func {
                    name: rest.to_string(),
                    def_line: line,
                    body: Vec::new(),
                });
            }
            "end" => {
                let func = current.take().ok_or(ScriptError::StrayStatement { line })?;
                funcs.insert(func.name.clone(), func);
            }
            _ => {
                let func = current.as_mut().ok_or(ScriptError::StrayStatement { line })?;
                let stmt = parse_stmt(head, rest, line, text)?;
                func.body.push(StmtLine { line, stmt });
            }
        }
    }

    if let Some(func) = current {
        return Err(ScriptError::UnterminatedDef { name: func.name });
    }
    if !funcs.contains_key(ENTRY_FUNC) {
        return Err(ScriptError::MissingEntry);
    }

    // Call targets are resolved at parse time, not at run time.
    for func in funcs.values() {
        for sl in &func.body {
            let target = match &sl.stmt {
                Stmt::Call { func }
                | Stmt::SpawnThread { func }
                | Stmt::SpawnTask { func } => Some(func),
                _ => None,
            };
            if let Some(target) = target {
                if !funcs.contains_key(target) {
                    return Err(ScriptError::UnknownFunction {
                        name: target.clone(),
                        line: sl.line,
                    });
                }
            }
        }
    }

    Ok(Program {
        name: name.into(),
        funcs,
    })
}

fn parse_stmt(head: &str, rest: &str, line: u32, text: &str) -> Result<Stmt, ScriptError> {
    let one_word = |stmt: &'static str| -> Result<String, ScriptError> {
        if rest.is_empty() || rest.contains(char::is_whitespace) {
            Err(ScriptError::BadArgument {
                line,
                stmt,
                text: rest.to_string(),
            })
        } else {
            Ok(rest.to_string())
        }
    };

    match head {
        "pass" => Ok(Stmt::Pass),
        "print" => Ok(Stmt::Print {
            text: rest.to_string(),
        }),
        "sleep" => rest
            .parse::<u64>()
            .map(|ms| Stmt::Sleep { ms })
            .map_err(|_| ScriptError::BadArgument {
                line,
                stmt: "sleep",
                text: rest.to_string(),
            }),
        "call" => Ok(Stmt::Call {
            func: one_word("call")?,
        }),
        "spawn_thread" => Ok(Stmt::SpawnThread {
            func: one_word("spawn_thread")?,
        }),
        "spawn_task" => Ok(Stmt::SpawnTask {
            func: one_word("spawn_task")?,
        }),
        "raise" => Ok(Stmt::Raise {
            message: rest.to_string(),
        }),
        _ => Err(ScriptError::UnknownStatement {
            line,
            text: text.to_string(),
        }),
    }
}
