use std::{env, fs, path::PathBuf, process};

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let Some(input) = args.next() else {
        eprintln!("usage: watc <input.wat> [output.wasm]");
        process::exit(2);
    };
    let output = match args.next() {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(&input).with_extension("wasm"),
    };

    let source = fs::read_to_string(&input)?;
    let bytes = match watc::compile(&source) {
        Ok(bytes) => bytes,
        Err(error) => {
            report_error(&source, &error);
            process::exit(1);
        }
    };

    fs::write(&output, &bytes)?;
    println!("wrote {} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

fn report_error(src: &str, error: &watc::Error) {
    eprintln!("Error: {error}");

    let Some(span) = error.span() else { return };
    let line = span.line.max(1) as usize;
    if let Some(content) = src.lines().nth(line - 1) {
        eprintln!("{line:>4} | {content}");
        let padding = (span.column.max(1) - 1) as usize;
        eprintln!("{:>4} | {}^", "", " ".repeat(padding));
    }
}
