use std::{env, fs, path::PathBuf, process::Command, process::ExitCode};

use hemlock::{analyze_program, compile_to_c, optimize_program, parse};

const USAGE: &str = "usage: hemlockc [options] <file.hml>
options:
  -o <output>     output executable name
  -c              emit C only, next to the source
  --emit-c <f>    emit C to the given path (implies -c unless -o is given)
  -k, --keep-c    keep the intermediate C file after linking
  -O0..-O3        optimization level forwarded to the C compiler
  --cc <path>     C compiler to use (default: cc)
  --runtime <p>   runtime library/archive to link (default: libhemlockrt.a)
  -v              verbose
  --version       print version
  -h              this help";

struct Options {
    input: Option<String>,
    output: Option<String>,
    emit_c_only: bool,
    emit_c_path: Option<String>,
    keep_c: bool,
    opt_level: String,
    cc: String,
    runtime: String,
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            emit_c_only: false,
            emit_c_path: None,
            keep_c: false,
            opt_level: "-O2".to_owned(),
            cc: "cc".to_owned(),
            runtime: "libhemlockrt.a".to_owned(),
            verbose: false,
        }
    }
}

fn main() -> ExitCode {
    let mut options = Options::default();
    let args: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-o" => {
                i += 1;
                match args.get(i) {
                    Some(value) => options.output = Some(value.clone()),
                    None => return arg_error("-o requires a value"),
                }
            }
            "-c" => options.emit_c_only = true,
            "--emit-c" => {
                i += 1;
                match args.get(i) {
                    Some(value) => options.emit_c_path = Some(value.clone()),
                    None => return arg_error("--emit-c requires a value"),
                }
            }
            "-k" | "--keep-c" => options.keep_c = true,
            "-O0" | "-O1" | "-O2" | "-O3" => options.opt_level = args[i].clone(),
            "--cc" => {
                i += 1;
                match args.get(i) {
                    Some(value) => options.cc = value.clone(),
                    None => return arg_error("--cc requires a value"),
                }
            }
            "--runtime" => {
                i += 1;
                match args.get(i) {
                    Some(value) => options.runtime = value.clone(),
                    None => return arg_error("--runtime requires a value"),
                }
            }
            "-v" => options.verbose = true,
            "--version" => {
                println!("hemlockc {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            other if other.starts_with('-') => {
                return arg_error(&format!("unknown option '{other}'"));
            }
            other => {
                if options.input.is_some() {
                    return arg_error("multiple input files");
                }
                options.input = Some(other.to_owned());
            }
        }
        i += 1;
    }

    let Some(input) = options.input.clone() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let source = match fs::read_to_string(&input) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read {input}: {err}");
            return ExitCode::from(2);
        }
    };

    // Front end: parse, optimize, analyze, lower to C.
    let result = parse(&source, &input);
    if !result.diagnostics.is_empty() {
        for diagnostic in &result.diagnostics {
            eprintln!("error: {input}:{}: {}", diagnostic.line, diagnostic.message);
        }
        return ExitCode::FAILURE;
    }
    let mut program = result.program;
    let stats = optimize_program(&mut program);
    if options.verbose {
        eprintln!(
            "optimizer: {} constants folded, {} booleans simplified, {} strength reductions",
            stats.constants_folded, stats.booleans_simplified, stats.strength_reductions
        );
    }
    let analysis = analyze_program(&program);
    let c_source = match compile_to_c(&program, &analysis) {
        Ok(c_source) => c_source,
        Err(errors) => {
            eprintln!("{errors}");
            eprintln!("hemlockc: {} error(s), no output written", errors.count());
            return ExitCode::FAILURE;
        }
    };

    let c_path = options
        .emit_c_path
        .clone()
        .unwrap_or_else(|| default_c_path(&input));
    if let Err(err) = fs::write(&c_path, &c_source) {
        eprintln!("error: cannot write {c_path}: {err}");
        return ExitCode::from(2);
    }
    if options.verbose {
        eprintln!("wrote {c_path}");
    }
    if options.emit_c_only || (options.emit_c_path.is_some() && options.output.is_none()) {
        return ExitCode::SUCCESS;
    }

    // Hand the C file to the system compiler and forward its status.
    let output = options
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&input));
    let mut command = Command::new(&options.cc);
    command
        .arg(&options.opt_level)
        .arg(&c_path)
        .arg(&options.runtime)
        .arg("-o")
        .arg(&output)
        .arg("-lm")
        .arg("-lpthread");
    if options.verbose {
        eprintln!("running: {command:?}");
    }
    let status = match command.status() {
        Ok(status) => status,
        Err(err) => {
            eprintln!("error: cannot run {}: {err}", options.cc);
            return ExitCode::from(2);
        }
    };
    if !options.keep_c {
        let _ = fs::remove_file(&c_path);
    }
    if status.success() {
        ExitCode::SUCCESS
    } else {
        // Forward the C compiler's exit status on link failure.
        let code = status.code().unwrap_or(1);
        ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1))
    }
}

fn arg_error(message: &str) -> ExitCode {
    eprintln!("error: {message}\n{USAGE}");
    ExitCode::from(2)
}

fn default_c_path(input: &str) -> String {
    let mut path = PathBuf::from(input);
    path.set_extension("c");
    path.to_string_lossy().into_owned()
}

fn default_output_path(input: &str) -> String {
    let mut path = PathBuf::from(input);
    path.set_extension("");
    path.to_string_lossy().into_owned()
}
