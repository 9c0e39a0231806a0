use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use watc::{lexer, token::TokenKind};

static INPUT: &str = r#"
(module
  (import "env" "print" (func $print (param i32)))
  (memory (export "mem") 1)
  (global $counter (mut i32) (i32.const 0))
  (func $fib (param $n i32) (result i32)
    (if (result i32) (i32.lt_s (local.get $n) (i32.const 2))
      (then (local.get $n))
      (else
        (i32.add
          (call $fib (i32.sub (local.get $n) (i32.const 1)))
          (call $fib (i32.sub (local.get $n) (i32.const 2)))))))
  (func $sum (param $n i32) (result i32)
    (local $acc i32)
    block $exit
      loop $again
        local.get $n
        i32.eqz
        br_if $exit
        (local.set $acc (i32.add (local.get $acc) (local.get $n)))
        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
        br $again
      end
    end
    local.get $acc)
  (export "fib" (func $fib))
  (export "sum" (func $sum))
  (data (i32.const 0) "bench \de\ad\be\ef"))
"#;

fn lex_input(input: &str) {
    let tokens = lexer::lex(input).unwrap();
    let mut opcodes = 0usize;
    for token in &tokens {
        if matches!(token.kind, TokenKind::Opcode(_)) {
            opcodes += 1;
        }
    }
    black_box((tokens.len(), opcodes));
}

fn compile_input(input: &str) {
    black_box(watc::compile(input).unwrap());
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("lex", |b| b.iter(|| lex_input(black_box(INPUT))));
    c.bench_function("compile", |b| b.iter(|| compile_input(black_box(INPUT))));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
