//! Fake chat-model processes for parley integration tests.
//!
//! Each [`FakeModel`] is a `/bin/sh` script written into its own temp
//! directory. Launch it with [`FakeModel::shell`] as the executable and
//! [`FakeModel::script`] as the script argument.
//!
//! The standard chat script understands a small command vocabulary so one
//! process can exercise many response shapes:
//!
//! | command        | response                                               |
//! |----------------|--------------------------------------------------------|
//! | `marker:TEXT`  | `TEXT`, then the completion sentinel                   |
//! | `prompt:TEXT`  | `TEXT`, then a `You: ` prompt                           |
//! | `multi`        | three lines (middle one blank), then the sentinel      |
//! | `noisy`        | log records and status chatter around `answer`          |
//! | `ansi`         | a colored line, then the sentinel                      |
//! | `rag`          | a `[RAG] `-prefixed line, then the sentinel             |
//! | `partial`      | one line and no terminator                             |
//! | `silent`       | nothing at all                                         |
//! | `slow:SECS`    | sleeps, then `slow done` and the sentinel              |
//! | `transcript`   | echo, `Assistant:` turn, then a `You: ` prompt          |
//! | `trailing`     | `answer`, the sentinel, then a stray line               |
//! | `die`          | exits with status 3                                    |
//! | `/clear`       | `Chat history cleared.` and the sentinel               |
//! | `/loadrag PATH`| sleeps one second, reports `PATH`, then the sentinel   |
//! | anything else  | `You said: <line>` and the sentinel                    |

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Interpreter used to run fake scripts.
pub const SHELL: &str = "/bin/sh";

/// File a [`FakeModel::with_grandchild`] script writes its background pid to.
pub const GRANDCHILD_PID_FILE: &str = "grandchild.pid";

const CHAT_LOOP: &str = r#"while IFS= read -r line; do
  case "$line" in
    exit) {exit_case} ;;
    marker:*) echo "${line#marker:}"; echo "COMMAND_COMPLETE" ;;
    prompt:*) echo "${line#prompt:}"; echo "You: " ;;
    multi) echo "first line"; echo ""; echo "third line"; echo "COMMAND_COMPLETE" ;;
    noisy)
      echo "| INFO | generate | sampling"
      echo "Bot is thinking..."
      echo "answer"
      echo "[DEBUG] tokens=3"
      echo "COMMAND_COMPLETE" ;;
    ansi) printf '\033[92mgreen\033[0m text\n'; echo "COMMAND_COMPLETE" ;;
    rag) echo "[RAG] Found 2 passages"; echo "COMMAND_COMPLETE" ;;
    partial) echo "partial answer" ;;
    silent) ;;
    slow:*) sleep "${line#slow:}"; echo "slow done"; echo "COMMAND_COMPLETE" ;;
    transcript)
      echo "User: transcript"
      echo "Assistant: Hello from the model."
      echo "How can I help?"
      echo "You: " ;;
    trailing) echo "answer"; echo "COMMAND_COMPLETE"; echo "stray line" ;;
    die) exit 3 ;;
    /clear) echo "Chat history cleared."; echo "COMMAND_COMPLETE" ;;
    /loadrag\ *) sleep 1; echo "Loaded documents from ${line#/loadrag }"; echo "COMMAND_COMPLETE" ;;
    *) echo "You said: $line"; echo "COMMAND_COMPLETE" ;;
  esac
done
"#;

const BANNER: &str = r#"echo "| INFO | fake_model | loading adapter"
echo "[System] args: $*"
echo "Entering chat mode. Type 'exit' to quit."
"#;

/// A fake model script on disk. The directory is removed on drop.
pub struct FakeModel {
    dir: TempDir,
    script: PathBuf,
}

impl FakeModel {
    /// Standard chat model: signals readiness, serves the command table,
    /// and exits on `exit`.
    pub fn chat() -> Self {
        Self::from_body(&format!(
            "{BANNER}{}",
            CHAT_LOOP.replace("{exit_case}", "echo \"Goodbye.\"; exit 0")
        ))
    }

    /// Like [`chat`](Self::chat) but ignores the `exit` command.
    pub fn ignoring_exit() -> Self {
        Self::from_body(&format!(
            "{BANNER}{}",
            CHAT_LOOP.replace("{exit_case}", ":")
        ))
    }

    /// Like [`ignoring_exit`](Self::ignoring_exit), but first starts a
    /// background `sleep` and records its pid in [`GRANDCHILD_PID_FILE`]
    /// inside [`dir`](Self::dir).
    pub fn with_grandchild() -> Self {
        Self::from_body(&format!(
            "sleep 1000 >/dev/null 2>&1 &\necho $! > \"$(dirname \"$0\")/{GRANDCHILD_PID_FILE}\"\n{BANNER}{}",
            CHAT_LOOP.replace("{exit_case}", ":")
        ))
    }

    /// Pid of the background process started by
    /// [`with_grandchild`](Self::with_grandchild), once it has been written.
    pub fn grandchild_pid(&self) -> Option<i32> {
        std::fs::read_to_string(self.dir().join(GRANDCHILD_PID_FILE))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Logs during startup but never prints the ready marker.
    pub fn never_ready() -> Self {
        Self::from_body("echo \"| INFO | fake_model | loading weights\"\nsleep 30\n")
    }

    /// Reports an import error on stderr during startup, then hangs.
    pub fn stderr_error() -> Self {
        Self::from_body(
            "echo \"Traceback (most recent call last):\" >&2\n\
             echo \"ModuleNotFoundError: No module named 'torch'\" >&2\n\
             sleep 30\n",
        )
    }

    /// Exits with a failure status before signalling readiness.
    pub fn exits_early() -> Self {
        Self::from_body("echo \"loading\"\nexit 1\n")
    }

    /// Write an arbitrary script body.
    pub fn from_body(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let script = dir.path().join("fake_model.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}"))
            .expect("failed to write fake model script");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("failed to chmod fake model script");
        }

        Self { dir, script }
    }

    pub fn shell() -> PathBuf {
        PathBuf::from(SHELL)
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// The temp directory holding the script; usable for extra fixtures.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}
