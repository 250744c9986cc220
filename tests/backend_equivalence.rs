use arrayvm::{
    BackendKind, BuildResult, Builder, Engine, EngineConfig, ExecError, ParameterFrame, Program, RecordedRange,
    RepeatedWindow, RunOutcome, Slot,
};

fn same(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

fn assert_same(label: &str, a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len(), "{label}: length");
    for (i, (&x, &y)) in a.iter().zip(b).enumerate() {
        assert!(same(x, y), "{label}: index {i}: {x} vs {y}");
    }
}

fn assert_same_outcome(label: &str, a: &RunOutcome, b: &RunOutcome) {
    assert_same(label, &a.scratch, &b.scratch);
    assert_eq!(
        (a.input_cursor, a.output_cursor, a.flag),
        (b.input_cursor, b.output_cursor, b.flag),
        "{label}: cursors"
    );
}

/// Every backend configuration this build supports, interpreter first.
fn configs() -> Vec<(&'static str, EngineConfig)> {
    let mut all = vec![("interpreter", EngineConfig::interpreted())];
    if cfg!(feature = "cranelift") {
        all.push(("native", EngineConfig::compiled(BackendKind::Native)));
        all.push(("source", EngineConfig { promote_locals: false, ..EngineConfig::compiled(BackendKind::Source) }));
        all.push((
            "source+locals",
            EngineConfig { min_local_uses: 1, max_locals: 4, ..EngineConfig::compiled(BackendKind::Source) },
        ));
    }
    all
}

fn run(program: &Program, config: &EngineConfig, inputs: &[f64]) -> (RunOutcome, Vec<f64>) {
    let mut outputs = vec![0.0; program.output_count()];
    let outcome = arrayvm::run(program, config, inputs, &mut outputs).unwrap();
    (outcome, outputs)
}

// ── Generator ────────────────────────────────────────────────────────

fn build_random(rng: &mut fastrand::Rng, len: usize) -> Program {
    let mut b = Builder::new();
    let mut slots: Vec<Slot> = (0..2).map(|i| b.copy_from_input(i).unwrap()).collect();
    let (mut depth, mut open, mut sources, mut dests) = (0, 0, 2, 0);
    while b.position() < len {
        let a = slots[rng.usize(0..slots.len())];
        let s = slots[rng.usize(0..slots.len())];
        match rng.u8(0..14) {
            0 if depth < 2 => {
                if rng.bool() { b.less_than(a, s).unwrap() } else { b.not_equals_value(a, 0).unwrap() }
                b.begin_if().unwrap();
                depth += 1;
            }
            1 if depth > 0 => {
                b.end_if().unwrap();
                depth -= 1;
            }
            2 if depth == 0 && open < 2 => {
                b.open_chunk("part").unwrap();
                open += 1;
            }
            3 if depth == 0 && open > 0 => {
                b.close_chunk().unwrap();
                open -= 1;
            }
            4 => {
                slots.push(b.copy_from_input(sources).unwrap());
                sources += 1;
            }
            5 => {
                b.copy_to_output(a, dests).unwrap();
                dests += 1;
            }
            6 => slots.push(b.copy_to_new(a).unwrap()),
            7 => b.multiply(a, s).unwrap(),
            8 => b.decrement(a, s).unwrap(),
            9 => b.equals(a, s).unwrap(),
            _ => b.increment(a, s).unwrap(),
        }
    }
    (0..depth).for_each(|_| b.end_if().unwrap());
    (0..open).for_each(|_| { b.close_chunk().unwrap(); });
    b.finish(&EngineConfig { max_chunk_len: 7, ..EngineConfig::default() }).unwrap()
}

fn random_inputs(rng: &mut fastrand::Rng, n: usize) -> Vec<f64> {
    (0..n).map(|_| f64::from(rng.i8(-3..4)) * 0.5).collect()
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn concrete_scenario_on_every_backend() {
    let mut b = Builder::new();
    let total = b.new_zero().unwrap();
    let a = b.copy_from_input(0).unwrap();
    let c = b.copy_from_input(1).unwrap();
    b.equals(a, c).unwrap();
    b.begin_if().unwrap();
    b.copy_from_input_into(total, 2).unwrap();
    b.copy_to_output(total, 0).unwrap();
    b.end_if().unwrap();
    b.increment(total, a).unwrap();
    b.increment(total, c).unwrap();
    b.copy_to_output(total, 1).unwrap();
    let program = b.finish(&EngineConfig::default()).unwrap();

    for (label, config) in configs() {
        let (outcome, outputs) = run(&program, &config, &[3.0, 7.0, 99.0]);
        assert_eq!(outputs[0], 10.0, "{label}");
        assert_eq!((outcome.input_cursor, outcome.output_cursor, outcome.flag), (2, 1, false), "{label}");
        assert_eq!(outcome.scratch, vec![10.0, 3.0, 7.0], "{label}");
    }
}

#[test]
fn random_programs_agree_across_backends() {
    let mut rng = fastrand::Rng::with_seed(0xa77a);
    for round in 0..25 {
        let program = build_random(&mut rng, 60);
        let inputs = random_inputs(&mut rng, program.input_count());
        let (reference, ref_out) = run(&program, &EngineConfig::interpreted(), &inputs);
        for (label, config) in configs().into_iter().skip(1) {
            let (outcome, outputs) = run(&program, &config, &inputs);
            let label = format!("{label} round {round}");
            assert_same_outcome(&label, &reference, &outcome);
            assert_same(&label, &ref_out, &outputs);
        }
    }
}

#[test]
fn hoisting_threshold_does_not_change_results() {
    let mut rng = fastrand::Rng::with_seed(7);
    let traced = EngineConfig { trace: true, ..EngineConfig::interpreted() };
    for _ in 0..15 {
        let program = build_random(&mut rng, 90).with_max_chunk_len(10_000);
        let inputs = random_inputs(&mut rng, program.input_count());
        let mut whole_out = vec![0.0; program.output_count()];
        let whole = Engine::new(program.clone(), &traced).unwrap().run(&inputs, &mut whole_out).unwrap();
        for threshold in [1, 2, 5, 13] {
            let split = program.with_max_chunk_len(threshold);
            let mut out = vec![0.0; program.output_count()];
            let outcome = Engine::new(split, &traced).unwrap().run(&inputs, &mut out).unwrap();
            let label = format!("threshold {threshold}");
            assert_same_outcome(&label, &whole, &outcome);
            assert_same(&label, &whole_out, &out);
            assert_eq!(whole.trace.logical_path(), outcome.trace.logical_path(), "{label}");
        }
    }
}

#[test]
fn rebind_keeps_prepared_ranges() {
    let mut rng = fastrand::Rng::with_seed(99);
    let program = build_random(&mut rng, 40);
    let config = configs().pop().map(|(_, c)| c).unwrap_or_else(EngineConfig::interpreted);
    let mut engine = Engine::new(program.clone(), &config).unwrap();
    let first = program.tree().leaves().into_iter().map(|id| program.tree().get(id).range.clone()).find(|r| !r.is_empty());
    let kind = first.clone().and_then(|r| engine.backend_of(r));

    engine.rebind(program.with_max_chunk_len(3)).unwrap();
    if let Some(range) = first {
        assert_eq!(engine.backend_of(range), kind);
    }
    let inputs = random_inputs(&mut rng, program.input_count());
    let mut out = vec![0.0; program.output_count()];
    let rebound = engine.run(&inputs, &mut out).unwrap();
    let (reference, _) = run(&program, &EngineConfig::interpreted(), &inputs);
    assert_same_outcome("rebound", &reference, &rebound);

    let other = build_random(&mut rng, 41);
    assert!(matches!(engine.rebind(other), Err(ExecError::StaleTree { .. })));
}

fn pair_body(b: &mut Builder, base: usize, dest: usize) -> BuildResult<()> {
    let x = b.copy_from_input(base)?;
    let y = b.copy_from_input(base + 1)?;
    let t = b.copy_to_new(x)?;
    b.multiply(t, y)?;
    b.greater_than(x, y)?;
    b.begin_if()?;
    b.increment(t, x)?;
    b.end_if()?;
    b.copy_to_output(t, dest)
}

#[test]
fn replayed_entries_match_independent_build() {
    let data = [1.0, 2.0, 5.0, 3.0, -1.0, 4.0, 0.0, 0.0, 0.0];

    let mut b = Builder::new();
    let mut set = RecordedRange::open(&mut b, "pairs").unwrap();
    for k in 0..3 {
        set.entry(&mut b, |b| pair_body(b, 2 * k, 6 + k)).unwrap();
    }
    set.close(&mut b, &[]).unwrap();
    let replayed = b.finish(&EngineConfig::default()).unwrap();

    let mut b = Builder::new();
    for k in 0..3 {
        b.open_chunk(&format!("pair{k}")).unwrap();
        pair_body(&mut b, 2 * k, 6 + k).unwrap();
        b.close_chunk().unwrap();
    }
    let independent = b.finish(&EngineConfig::default()).unwrap();

    assert!(replayed.slot_count() < independent.slot_count());
    assert_eq!(replayed.ordered_sources(), independent.ordered_sources());
    assert_eq!(replayed.ordered_destinations(), independent.ordered_destinations());

    for (label, config) in configs() {
        let mut results = Vec::new();
        for program in [&replayed, &independent] {
            let inputs = program.gather_inputs(&data).unwrap();
            let (_, outputs) = run(program, &config, &inputs);
            let mut result = data;
            program.scatter_outputs(&outputs, &mut result).unwrap();
            results.push(result);
        }
        assert_same(label, &results[0], &results[1]);
        assert_eq!(&results[0][6..], &[1.0 * 2.0, 5.0 * 3.0 + 5.0, -4.0], "{label}");
    }
}

#[test]
fn parallel_entries_join_through_depth_scope() {
    let mut b = Builder::new();
    let total = b.new_zero().unwrap();
    let mut set = RecordedRange::open_parallel(&mut b, "terms").unwrap();
    for k in 0..5 {
        set.entry(&mut b, |b| {
            b.enter_depth_scope();
            let x = b.copy_from_input(k)?;
            b.multiply(x, x)?;
            b.increment(total, x)?;
            b.copy_to_output(x, k)?;
            b.exit_depth_scope()
        })
        .unwrap();
    }
    set.close(&mut b, &[]).unwrap();
    let program = b.finish(&EngineConfig::default()).unwrap();
    let inputs = [1.0, -2.0, 3.0, 0.5, 4.0];

    for (label, config) in configs() {
        for parallel in [false, true] {
            let config = EngineConfig { parallel, ..config.clone() };
            let (outcome, outputs) = run(&program, &config, &inputs);
            assert_eq!(outcome.scratch[total.index()], 1.0 + 4.0 + 9.0 + 0.25 + 16.0, "{label}");
            assert_eq!(outputs, vec![1.0, 4.0, 9.0, 0.25, 16.0], "{label}");
            assert_eq!((outcome.input_cursor, outcome.output_cursor), (5, 5), "{label}");
        }
    }
}

#[test]
fn nested_parallel_join_reaches_root() {
    let mut b = Builder::new();
    let total = b.new_zero().unwrap();
    b.open_parallel_chunk("outer").unwrap();
    for half in 0..2 {
        b.open_chunk(&format!("half{half}")).unwrap();
        b.open_parallel_chunk(&format!("inner{half}")).unwrap();
        for k in 0..2 {
            let n = 2 * half + k;
            b.open_chunk(&format!("term{n}")).unwrap();
            b.enter_depth_scope();
            let x = b.copy_from_input(n).unwrap();
            b.multiply(x, x).unwrap();
            b.increment(total, x).unwrap();
            b.copy_to_output(x, n).unwrap();
            b.exit_depth_scope().unwrap();
            b.close_chunk().unwrap();
        }
        b.close_parallel_chunk(&[]).unwrap();
        b.close_chunk().unwrap();
    }
    b.close_parallel_chunk(&[]).unwrap();
    b.copy_to_output(total, 4).unwrap();
    let program = b.finish(&EngineConfig::default()).unwrap();
    let inputs = [1.0, -2.0, 3.0, 0.5];

    for (label, config) in configs() {
        for parallel in [false, true] {
            let config = EngineConfig { parallel, ..config.clone() };
            let (outcome, outputs) = run(&program, &config, &inputs);
            assert_eq!(outcome.scratch[total.index()], 14.25, "{label}");
            assert_eq!(outputs, vec![1.0, 4.0, 9.0, 0.25, 14.25], "{label}");
            assert_eq!((outcome.input_cursor, outcome.output_cursor), (4, 5), "{label}");
        }
    }
}

#[test]
fn native_engine_rebuilt_for_a_wide_program() {
    if !cfg!(feature = "cranelift") {
        return;
    }
    let mut b = Builder::new();
    let acc = b.copy_from_input(0).unwrap();
    let step = b.copy_from_input(1).unwrap();
    for i in 0..400 {
        b.open_chunk(&format!("step{i}")).unwrap();
        b.increment(acc, step).unwrap();
        b.close_chunk().unwrap();
    }
    b.copy_to_output(acc, 0).unwrap();
    let program = b.finish(&EngineConfig { max_chunk_len: 1, ..EngineConfig::default() }).unwrap();
    let inputs = [1.0, 0.25];
    let (reference, expected) = run(&program, &EngineConfig::interpreted(), &inputs);
    assert_eq!(expected, vec![101.0]);

    let config = EngineConfig::compiled(BackendKind::Native);
    for round in 0..150 {
        let engine = Engine::new(program.clone(), &config).unwrap();
        let mut outputs = vec![0.0; 1];
        let outcome = engine.run(&inputs, &mut outputs).unwrap();
        assert_same_outcome(&format!("round {round}"), &reference, &outcome);
        assert_eq!(outputs, expected, "round {round}");
    }
}

#[test]
fn repeated_window_with_parameter_frame() {
    let mut b = Builder::new();
    let frame = ParameterFrame::allocate(&mut b, 2);
    frame.fill_from_inputs(&mut b, &[0, 1]).unwrap();
    let (acc, step) = (frame.get(0).unwrap(), frame.get(1).unwrap());
    let mut window = RepeatedWindow::new("double");
    window
        .run(&mut b, |b| {
            b.increment(acc, step)?;
            b.increment(step, step)
        })
        .unwrap();
    window.repeat(&mut b, 3).unwrap();
    b.copy_to_output(acc, 0).unwrap();
    let program = b.finish(&EngineConfig { max_chunk_len: 1, ..EngineConfig::default() }).unwrap();

    for (label, config) in configs() {
        let (_, outputs) = run(&program, &config, &[0.0, 1.0]);
        assert_eq!(outputs, vec![1.0 + 2.0 + 4.0 + 8.0], "{label}");
    }
}
