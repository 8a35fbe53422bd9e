//! external blob transformers
//!
//! a pipeline step is an executable named `cas-pipe-<name>` resolved on
//! `PATH` (names containing a path separator or a dot are taken verbatim).
//! the tool reads a blob on stdin and writes the transformed blob to
//! stdout; stderr becomes the error text on a nonzero exit. results are
//! memoised as [`TransformOp`] records keyed by the hash of the tool
//! itself, so re-running a pipeline only processes new inputs.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};
use crate::files::hash_file;
use crate::hash::{Ref, SizedRef};
use crate::schema::{self, Object, TransformOp};
use crate::store::{complete_blob, Store};

/// prefix for pipeline executables looked up on `PATH`
pub const PIPE_PREFIX: &str = "cas-pipe-";

/// result of one pipeline input
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeResult {
    pub src: Ref,
    pub dst: Ref,
    /// true when the result came from a stored [`TransformOp`]
    pub cached: bool,
}

/// resolve a pipeline command name to an executable path
pub fn resolve_pipe_command(name: &str) -> Result<PathBuf> {
    if name.contains(['/', '\\', '.']) {
        let path = PathBuf::from(name);
        if path.is_file() {
            return Ok(path);
        }
        return Err(Error::Pipeline(format!("command not found: {name}")));
    }
    let full = format!("{PIPE_PREFIX}{name}");
    for dir in std::env::split_paths(&std::env::var_os("PATH").unwrap_or_default()) {
        let cand = dir.join(&full);
        if cand.is_file() {
            return Ok(cand);
        }
    }
    Err(Error::Pipeline(format!("command not found: {full}")))
}

impl Store {
    /// run a pipeline command over a set of input blobs
    ///
    /// inputs with a recorded [`TransformOp`] for this tool are reused
    /// without spawning the command.
    pub fn run_pipeline(
        &self,
        cancel: &CancelToken,
        name: &str,
        inputs: &[Ref],
    ) -> Result<Vec<PipeResult>> {
        let cpath = resolve_pipe_command(name)?;
        let op = hash_file(cancel, &cpath, false)?;

        // pre-scan stored transform records for cache hits
        let mut cached: HashMap<Ref, Ref> = HashMap::new();
        for item in self.iterate_schema(cancel, &[schema::TYPE_TRANSFORM_OP.to_string()]) {
            let sr = item?;
            let t = match self.decode_schema(cancel, &sr.r#ref) {
                Ok(Object::TransformOp(t)) => t,
                Ok(other) => {
                    warn!("unexpected type: {}", other.type_name());
                    continue;
                }
                Err(e) => {
                    warn!(blob = %sr.r#ref, "cannot decode transform record: {e}");
                    continue;
                }
            };
            if t.op == op.r#ref && inputs.contains(&t.src) {
                cached.insert(t.src, t.dst);
            }
        }

        let mut out = Vec::with_capacity(inputs.len());
        for src in inputs {
            cancel.err()?;
            if let Some(dst) = cached.get(src) {
                out.push(PipeResult {
                    src: *src,
                    dst: *dst,
                    cached: true,
                });
                continue;
            }
            let sr = self.process_blob(cancel, &cpath, op.r#ref, src)?;
            out.push(PipeResult {
                src: *src,
                dst: sr.r#ref,
                cached: false,
            });
        }
        Ok(out)
    }

    fn process_blob(
        &self,
        cancel: &CancelToken,
        cpath: &Path,
        op: Ref,
        src: &Ref,
    ) -> Result<SizedRef> {
        let (mut input, _) = self.fetch_blob(cancel, src)?;

        let mut child = Command::new(cpath)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_path(cpath)?;
        let mut stdin = child.stdin.take().expect("stdin is piped");
        let mut stdout = child.stdout.take().expect("stdout is piped");
        let mut stderr = child.stderr.take().expect("stderr is piped");

        let sr = std::thread::scope(|scope| -> Result<SizedRef> {
            scope.spawn(move || {
                let mut buf = [0u8; 32 * 1024];
                loop {
                    let n = match input.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stdin.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
                // dropping stdin closes the pipe
            });
            let errtext = scope.spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            });

            // defer creating the writer until the tool produces output
            let mut w = None;
            let mut buf = [0u8; 32 * 1024];
            let res = (|| -> Result<Option<SizedRef>> {
                loop {
                    cancel.err()?;
                    let n = stdout.read(&mut buf).with_path("<pipe>")?;
                    if n == 0 {
                        break;
                    }
                    let bw = match &mut w {
                        Some(bw) => bw,
                        None => w.insert(self.begin_blob(cancel)?),
                    };
                    bw.write_all(&buf[..n])
                        .map_err(|e| Error::from_io(e, "<pipe>"))?;
                }
                Ok(None)
            })();

            // close our end of the pipe so the child cannot block on write
            drop(stdout);
            let status = child.wait().with_path(cpath)?;
            res?;
            if !status.success() {
                let text = errtext.join().unwrap_or_default();
                let text = text.trim();
                if !text.is_empty() {
                    return Err(Error::Pipeline(text.to_string()));
                }
                return Err(Error::Pipeline(format!("command failed: {status}")));
            }
            let mut bw = match w {
                Some(bw) => bw,
                None => return Err(Error::Pipeline("empty output discarded".to_string())),
            };
            let sr = complete_blob(bw.as_mut(), Ref::zero());
            let _ = bw.close();
            sr
        })?;

        if let Err(e) = self.store_schema(
            cancel,
            &Object::TransformOp(TransformOp {
                src: *src,
                op,
                dst: sr.r#ref,
            }),
        ) {
            warn!("cannot record transform: {e}");
        }
        Ok(sr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::storage::MemoryStorage;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn mem_store() -> Store {
        Store::new(Arc::new(MemoryStorage::new()))
    }

    fn write_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_pipeline_transforms_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        // a path with a separator is used verbatim, no PATH lookup
        let tool = write_tool(
            dir.path(),
            "cas-pipe-upper",
            "#!/bin/sh\ntr 'a-z' 'A-Z'\n",
        );

        let s = mem_store();
        let cancel = CancelToken::new();
        let sr = s
            .store_blob(&cancel, &mut &b"hello pipeline"[..], &StoreConfig::default())
            .unwrap();

        let results = s
            .run_pipeline(&cancel, tool.to_str().unwrap(), &[sr.r#ref])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].cached);
        assert_eq!(results[0].dst, Ref::from_bytes(b"HELLO PIPELINE"));

        // the output blob is stored
        assert_eq!(s.stat_blob(&cancel, &results[0].dst).unwrap(), 14);

        // a second run reuses the recorded transform
        let again = s
            .run_pipeline(&cancel, tool.to_str().unwrap(), &[sr.r#ref])
            .unwrap();
        assert!(again[0].cached);
        assert_eq!(again[0].dst, results[0].dst);
    }

    #[test]
    fn test_pipeline_failure_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(
            dir.path(),
            "cas-pipe-fail",
            "#!/bin/sh\necho 'boom: bad input' >&2\nexit 3\n",
        );

        let s = mem_store();
        let cancel = CancelToken::new();
        let sr = s
            .store_blob(&cancel, &mut &b"input"[..], &StoreConfig::default())
            .unwrap();

        let err = s
            .run_pipeline(&cancel, tool.to_str().unwrap(), &[sr.r#ref])
            .unwrap_err();
        match err {
            Error::Pipeline(text) => assert_eq!(text, "boom: bad input"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_pipeline_empty_output_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(
            dir.path(),
            "cas-pipe-null",
            "#!/bin/sh\ncat > /dev/null\n",
        );

        let s = mem_store();
        let cancel = CancelToken::new();
        let sr = s
            .store_blob(&cancel, &mut &b"input"[..], &StoreConfig::default())
            .unwrap();

        let err = s
            .run_pipeline(&cancel, tool.to_str().unwrap(), &[sr.r#ref])
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline(_)));
    }

    #[test]
    fn test_resolve_missing_command() {
        assert!(resolve_pipe_command("definitely-missing-tool-xyz").is_err());
    }
}
