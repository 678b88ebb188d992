use std::{env, fs, process::ExitCode};

use hemlock::{
    Interpreter, NoopTracer, ResourceLimits, StdPrint, StderrTracer, optimize_program, parse,
};

const USAGE: &str = "usage: hemlock <file.hml> [--stack-depth N] [--profile]";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut file_path: Option<String> = None;
    let mut limits = ResourceLimits::default();
    let mut profile = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--stack-depth" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    eprintln!("error: --stack-depth requires a value");
                    return ExitCode::from(2);
                };
                match value.parse::<usize>() {
                    Ok(depth) if depth > 0 => limits = ResourceLimits::with_stack_depth(depth),
                    _ => {
                        eprintln!("error: invalid stack depth '{value}'");
                        return ExitCode::from(2);
                    }
                }
            }
            "--profile" => profile = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            other if other.starts_with('-') => {
                eprintln!("error: unknown option '{other}'\n{USAGE}");
                return ExitCode::from(2);
            }
            other => {
                if file_path.is_some() {
                    eprintln!("error: multiple input files\n{USAGE}");
                    return ExitCode::from(2);
                }
                file_path = Some(other.to_owned());
            }
        }
        i += 1;
    }

    let Some(file_path) = file_path else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let source = match read_file(&file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };

    let result = parse(&source, &file_path);
    if !result.diagnostics.is_empty() {
        for diagnostic in &result.diagnostics {
            eprintln!("error: {file_path}:{}: {}", diagnostic.line, diagnostic.message);
        }
        return ExitCode::FAILURE;
    }
    let mut program = result.program;
    optimize_program(&mut program);

    let mut writer = StdPrint;
    let outcome = if profile {
        let mut interp = Interpreter::new(&program, limits, &mut writer, StderrTracer::new());
        interp.run()
    } else {
        let mut interp = Interpreter::new(&program, limits, &mut writer, NoopTracer);
        interp.run()
    };
    drop(writer);

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(exception) => {
            eprintln!("{exception}");
            if exception.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => return Err(format!("cannot read {file_path}: {err}")),
    }
    fs::read_to_string(file_path).map_err(|err| format!("cannot read {file_path}: {err}"))
}
