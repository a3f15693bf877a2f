//! Engines written as small shell scripts. Both sides play the fool's mate, so every game
//! ends with black mating on the fourth ply.

use std::path::{Path, PathBuf};

const UCI_FOOLS_MATE: &str = r#"
count=0
while read -r cmd rest; do
  case "$cmd" in
    uci) echo "id name FoolsMate"; echo "uciok" ;;
    isready) echo "readyok" ;;
    position)
      set -- $rest
      count=0
      if [ "$2" = moves ]; then count=$(($# - 2)); fi ;;
    go)
      set -- f2f3 e7e5 g2g4 d8h4
      shift $count
      echo "info depth 1 score cp 0"
      echo "bestmove $1" ;;
    quit) exit 0 ;;
  esac
done
"#;

const XBOARD_FOOLS_MATE: &str = r#"
set -- f2f3 e7e5 g2g4 d8h4
while read -r cmd rest; do
  case "$cmd" in
    protover) echo "feature ping=1 setboard=1 usermove=1 done=1" ;;
    ping) echo "pong $rest" ;;
    new) set -- f2f3 e7e5 g2g4 d8h4 ;;
    usermove) shift ;;
    go) echo "move $1"; shift ;;
    quit) exit 0 ;;
  esac
done
"#;

/// Reads everything, answers nothing.
const SILENT: &str = r#"
while read -r line; do :; done
"#;

pub struct MockEngines {
    pub dir: tempfile::TempDir,
}

impl MockEngines {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (name, script) in [
            ("uci.sh", UCI_FOOLS_MATE),
            ("xboard.sh", XBOARD_FOOLS_MATE),
            ("silent.sh", SILENT),
        ] {
            std::fs::write(dir.path().join(name), script).unwrap();
        }
        MockEngines { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `"<protocol> sh <script>"`, scripts are run through `sh` so they need no exec bit.
    pub fn entry(&self, protocol: &str, script: &str) -> String {
        format!("{protocol} sh {}", self.path().join(script).display())
    }

    /// Write a match file next to the scripts.
    pub fn match_file(&self, settings: &str, engines: &[(&str, &str, &str)]) -> PathBuf {
        let mut text = settings.to_string();
        text.push_str("\nengines:\n");
        for (name, protocol, script) in engines {
            text.push_str(&format!("  - {name}: \"{}\"\n", self.entry(protocol, script)));
        }
        let path = self.path().join("match.yaml");
        std::fs::write(&path, text).unwrap();
        path
    }
}
