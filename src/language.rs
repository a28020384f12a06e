use lazy_static::lazy_static;
use regex::Captures;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::str;
use which::which;

use crate::sandbox::CommandTuple;

/// File stem every submission is staged under.
pub const PROGRAM_NAME: &str = "program";

fn no_transform(source_text: String, _source_name: String) -> String {
    source_text
}

#[derive(Clone)]
pub enum Compile {
    NoCompile,
    /// Source transform (text, class/file stem) and compiler command.
    Command(
        &'static (dyn Fn(String, String) -> String + Sync),
        CommandTuple,
    ),
}

/// One supported language runtime.
///
/// Commands are templates: `{.}` expands to the staged source file name and
/// `{}` to its stem.
#[derive(Clone)]
pub struct LanguageParams {
    pub order: i32,
    pub name: String,
    pub suffix: String,
    pub compile: Compile,
    pub run: CommandTuple,
    pub process_limit: u32,
    /// Whether the memory limit is enforced as an address-space cap. The JVM
    /// reserves gigabytes it never touches and is bounded by `-Xmx` instead.
    pub limit_address_space: bool,
}

fn expand(template: &str, source_name: &str) -> String {
    template
        .replace("{.}", source_name)
        .replace("{}", PROGRAM_NAME)
}

fn expand_command(command: &CommandTuple, source_name: &str) -> CommandTuple {
    CommandTuple {
        binary_path: expand(&command.binary_path.to_string_lossy(), source_name).into(),
        args: command
            .args
            .iter()
            .map(|arg| expand(arg, source_name))
            .collect(),
    }
}

impl LanguageParams {
    pub fn source_name(&self) -> String {
        format!("{}{}", PROGRAM_NAME, self.suffix)
    }

    pub fn transform_source(&self, source_text: String) -> String {
        match &self.compile {
            Compile::Command(transform, _) => transform(source_text, PROGRAM_NAME.into()),
            Compile::NoCompile => source_text,
        }
    }

    pub fn compile_command(&self) -> Option<CommandTuple> {
        match &self.compile {
            Compile::Command(_, command) => Some(expand_command(command, &self.source_name())),
            Compile::NoCompile => None,
        }
    }

    pub fn run_command(&self) -> CommandTuple {
        expand_command(&self.run, &self.source_name())
    }
}

fn detect_version(binary_path: &PathBuf) -> Option<String> {
    lazy_static! {
        static ref VERSION_REGEX: Regex = Regex::new(r"(?m)\d+\.\d+\.\d+").unwrap();
    }
    let output = Command::new(binary_path).arg("--version").output().ok()?;
    let stdout = str::from_utf8(&output.stdout).ok()?;
    VERSION_REGEX.find(stdout).map(|m| m.as_str().to_string())
}

fn locate(binary: &str, fallback: &str) -> PathBuf {
    which(binary).unwrap_or_else(|_| PathBuf::from(fallback))
}

pub fn get_supported_languages() -> HashMap<String, LanguageParams> {
    fn build_gcc_params<'a>(
        order: i32,
        name: &'a str,
        binary_path: PathBuf,
        suffix: &'a str,
        x: &'a str,
        std: &'a str,
    ) -> LanguageParams {
        let version = detect_version(&binary_path).unwrap_or_default();

        LanguageParams {
            order,
            suffix: suffix.into(),
            name: name.replace("{}", &version).trim_end().into(),
            compile: Compile::Command(
                &no_transform,
                CommandTuple {
                    binary_path,
                    args: vec![
                        // ONLINE_JUDGE define as in Codeforces
                        "-DONLINE_JUDGE".into(),
                        // Link to the math library
                        "-lm".into(),
                        // Strip all symbols
                        "-s".into(),
                        // Use std
                        format!("-std={}", std),
                        // Define language used
                        "-x".into(),
                        x.into(),
                        // Level 2 optimization
                        "-O2".into(),
                        // Output to exe
                        "-o".into(),
                        "{}".into(),
                        // Input from source
                        "{.}".into(),
                    ],
                },
            ),
            run: CommandTuple {
                binary_path: "./{}".into(),
                args: vec![],
            },
            process_limit: 1,
            limit_address_space: true,
        }
    }

    let mut languages = HashMap::new();
    languages.insert(
        "cpp.17.g++".into(),
        build_gcc_params(
            2,
            "GNU G++17 {}",
            locate("g++", "/usr/bin/g++"),
            ".cpp",
            "c++",
            "c++17",
        ),
    );
    languages.insert(
        "c.18.gcc".into(),
        build_gcc_params(
            5,
            "GNU GCC C18 {}",
            locate("gcc", "/usr/bin/gcc"),
            ".c",
            "c",
            "c18",
        ),
    );
    languages.insert(
        "java.8".into(),
        LanguageParams {
            order: 7,
            name: "Java 8".into(),
            suffix: ".java".into(),
            compile: Compile::Command(
                &|source_text, source_name| {
                    lazy_static! {
                        static ref PUBLIC_CLASS_REGEX: Regex =
                            Regex::new(r"(?i)([^{}]*public\s+class\s+)(\w+)").unwrap();
                    }
                    PUBLIC_CLASS_REGEX
                        .replacen(&source_text, 1, |caps: &Captures| {
                            format!("{}{}", &caps[1], source_name)
                        })
                        .into()
                },
                CommandTuple {
                    binary_path: locate("javac", "/usr/bin/javac"),
                    args: vec![
                        "-J-Xmx512m".into(),
                        "-J-XX:+UseSerialGC".into(),
                        "-J-XX:MaxMetaspaceSize=128m".into(),
                        "-J-XX:CompressedClassSpaceSize=64m".into(),
                        "{.}".into(),
                    ],
                },
            ),
            run: CommandTuple {
                binary_path: locate("java", "/usr/bin/java"),
                args: vec![
                    "-Xmx512m".into(),
                    "-Xss64m".into(),
                    "-XX:+UseSerialGC".into(),
                    "-DONLINE_JUDGE=true".into(),
                    "-Duser.language=en".into(),
                    "-Duser.region=US".into(),
                    "-Duser.variant=US".into(),
                    "{}".into(),
                ],
            },
            process_limit: 32,
            limit_address_space: false,
        },
    );
    languages.insert(
        "python.3".into(),
        LanguageParams {
            order: 8,
            name: "Python 3".into(),
            suffix: ".py".into(),
            compile: Compile::NoCompile,
            run: CommandTuple {
                binary_path: locate("python3", "/usr/bin/python3"),
                args: vec!["{.}".into()],
            },
            process_limit: 1,
            limit_address_space: true,
        },
    );
    languages
}
