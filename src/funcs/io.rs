//! I/O, diagnostic, and process functions.

use tracing::{info, warn};

use crate::caps::SpawnRequest;
use crate::error::{MakeError, Result};
use crate::expand::ExpandCtx;
use crate::run::recipe::export_environment;

/// `$(file op name[,text])` with `op` one of `>`, `>>`, `<`.
pub fn file(ctx: &mut ExpandCtx<'_>, args: &[String]) -> Result<String> {
    let spec = args[0].trim();
    let (op, name) = if let Some(rest) = spec.strip_prefix(">>") {
        (">>", rest)
    } else if let Some(rest) = spec.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = spec.strip_prefix('<') {
        ("<", rest)
    } else {
        return Err(MakeError::Expand {
            message: format!("'file' argument must begin with >, >>, or <: '{spec}'"),
        });
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(MakeError::Expand {
            message: "'file' missing a file name".to_owned(),
        });
    }
    let io_err = |source| MakeError::FileIo {
        op: op.to_owned(),
        path: name.to_owned(),
        source: std::sync::Arc::new(source),
    };
    match op {
        "<" => {
            let text = ctx.caps.fs.read_file(name).map_err(io_err)?;
            Ok(text.strip_suffix('\n').map_or(text.clone(), str::to_owned))
        }
        _ => {
            let mut text = args.get(1).cloned().unwrap_or_default();
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            ctx.caps
                .fs
                .write_file(name, &text, op == ">>")
                .map_err(io_err)?;
            Ok(String::new())
        }
    }
}

/// `$(error ...)`: abort expansion with the given message.
pub fn error_fn(message: &str) -> Result<String> {
    Err(MakeError::User {
        message: message.to_owned(),
    })
}

/// `$(warning ...)`.
#[must_use]
pub fn warning_fn(message: &str) -> String {
    warn!(target: "kumade::make", "{message}");
    String::new()
}

/// `$(info ...)`.
#[must_use]
pub fn info_fn(message: &str) -> String {
    info!(target: "kumade::make", "{message}");
    String::new()
}

/// `$(shell cmd)`: run through the Shell capability, recording the exit
/// status in `.SHELLEXIT` and collapsing output newlines to spaces.
pub fn shell(ctx: &mut ExpandCtx<'_>, command: &str) -> Result<String> {
    let interpreter = lookup_expanded(ctx, "SHELL")?;
    let flags = lookup_expanded(ctx, ".SHELLFLAGS")?;
    let env = export_environment(ctx)?;
    let cwd = ctx.state.curdir.clone();
    let mut captured = String::new();
    let request = SpawnRequest {
        command_line: command,
        cwd: &cwd,
        env: &env,
        shell: &interpreter,
        shell_flags: &flags,
    };
    let code = ctx
        .caps
        .shell
        .spawn(&request, &mut |chunk| {
            if let crate::caps::OutputChunk::Stdout(text) = chunk {
                captured.push_str(text);
            }
        })
        .map_err(|source| MakeError::Spawn {
            target: "$(shell)".to_owned(),
            source: std::sync::Arc::new(source),
        })?;
    ctx.state.shell_exit = code;
    let trimmed = captured.trim_end_matches('\n');
    Ok(trimmed.replace('\n', " "))
}

/// `$(eval text)`: feed the expanded text back through the parser.
pub fn eval(ctx: &mut ExpandCtx<'_>, text: &str) -> Result<String> {
    crate::parse::parse_source(ctx.state, ctx.caps, text, None)?;
    Ok(String::new())
}

fn lookup_expanded(ctx: &mut ExpandCtx<'_>, name: &str) -> Result<String> {
    ctx.expand(&format!("$({name})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capabilities;
    use crate::engine::Engine;

    #[test]
    fn error_function_aborts_with_message() {
        let engine = Engine::new(Capabilities::host());
        let err = engine.expand("$(error missing frobnicator)").expect_err("abort");
        assert_eq!(err.to_string(), "missing frobnicator");
    }

    #[test]
    fn eval_defines_variables_mid_expansion() {
        let engine = Engine::new(Capabilities::host());
        engine
            .parse_str("$(eval NEW := from-eval)", None)
            .expect("parse");
        assert_eq!(engine.variable("NEW").as_deref(), Some("from-eval"));
    }

    #[test]
    fn file_rejects_missing_operator() {
        let engine = Engine::new(Capabilities::host());
        let err = engine.expand("$(file nope.txt,x)").expect_err("bad op");
        assert!(err.to_string().contains("must begin with"));
    }
}
