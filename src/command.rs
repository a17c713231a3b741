use crate::models::SourceFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    C,
    Cpp,
    Java,
}

impl Language {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Self::Python),
            "javascript" | "js" | "node" => Some(Self::JavaScript),
            "c" => Some(Self::C),
            "cpp" | "c++" => Some(Self::Cpp),
            "java" => Some(Self::Java),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Java => "java",
        }
    }

    fn source_extension(&self) -> &'static str {
        match self {
            Self::Python => ".py",
            Self::JavaScript => ".js",
            Self::C => ".c",
            Self::Cpp => ".cpp",
            Self::Java => ".java",
        }
    }

    /// Manifest file a bundle may carry to declare third-party packages.
    /// The compiled set has no dependency story here.
    pub fn manifest_file(&self) -> Option<&'static str> {
        match self {
            Self::Python => Some("requirements.txt"),
            Self::JavaScript => Some("package.json"),
            Self::C | Self::Cpp | Self::Java => None,
        }
    }

    /// Directory inside the scratch dir the installed dependency tree lives in.
    pub fn deps_dir(&self) -> Option<&'static str> {
        match self {
            Self::Python => Some(".deps"),
            Self::JavaScript => Some("node_modules"),
            Self::C | Self::Cpp | Self::Java => None,
        }
    }

    pub fn install_command(&self) -> Option<&'static str> {
        match self {
            Self::Python => {
                Some("python3 -m pip install --quiet --no-cache-dir --target .deps -r requirements.txt")
            }
            Self::JavaScript => Some("npm install --no-audit --no-fund --loglevel=error"),
            Self::C | Self::Cpp | Self::Java => None,
        }
    }
}

/// Builds the compile+run pipeline for a validated bundle. Pure: no I/O, no
/// state. The returned string runs under `sh -c` with the scratch directory
/// as working directory; file names were validated upstream and are quoted
/// here.
pub fn synthesize(language: Language, files: &[SourceFile], entry_file: &str) -> String {
    let entry = quoted(entry_file);
    match language {
        Language::Python => {
            if bundle_declares_deps(language, files) {
                // -I would also discard PYTHONPATH, so isolation drops to
                // -B -s when a dependency tree has to stay importable.
                format!("PYTHONPATH=.deps python3 -B -s {entry}")
            } else {
                format!("python3 -I {entry}")
            }
        }
        Language::JavaScript => format!("node {entry}"),
        Language::C => format!("gcc -O2 -o ./app.bin {} && ./app.bin", sources(language, files)),
        Language::Cpp => format!("g++ -O2 -o ./app.bin {} && ./app.bin", sources(language, files)),
        Language::Java => {
            let main_class = files
                .iter()
                .find(|f| f.name == entry_file)
                .map(|f| java_main_class(&f.content))
                .unwrap_or_else(|| "Main".to_string());
            format!("javac {} && java -cp . {main_class}", sources(language, files))
        }
    }
}

pub fn bundle_declares_deps(language: Language, files: &[SourceFile]) -> bool {
    language
        .manifest_file()
        .is_some_and(|manifest| files.iter().any(|f| f.name == manifest))
}

fn sources(language: Language, files: &[SourceFile]) -> String {
    let ext = language.source_extension();
    files
        .iter()
        .filter(|f| f.name.ends_with(ext))
        .map(|f| quoted(&f.name))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quoted(name: &str) -> String {
    format!("'{}'", name.replace('\'', r"'\''"))
}

/// Scans for a `public class <Name>` declaration and falls back to `Main`
/// when the entry file carries none.
fn java_main_class(source: &str) -> String {
    for line in source.lines() {
        let mut rest = line.trim_start();
        let Some(stripped) = rest.strip_prefix("public") else {
            continue;
        };
        rest = stripped.trim_start();
        for modifier in ["final", "abstract"] {
            if let Some(stripped) = rest.strip_prefix(modifier) {
                rest = stripped.trim_start();
            }
        }
        let Some(stripped) = rest.strip_prefix("class") else {
            continue;
        };
        let name: String = stripped
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$'))
            .collect();
        if !name.is_empty() {
            return name;
        }
    }
    "Main".to_string()
}
