//! BatchDecoder against the scripted engine.

mod common;

use common::{FakeModel, MemoryOp, Script, SharedLog};
use llama_engine::TokenId;
use llama_kv::ContextWindow;
use llama_session::{BatchDecoder, SessionError};

fn model(script: Script) -> (FakeModel, SharedLog) {
    let log = SharedLog::default();
    (
        FakeModel {
            script,
            log: log.clone(),
        },
        log,
    )
}

fn tokens(n: usize) -> Vec<TokenId> {
    (0..n).map(|i| (i % 200) as TokenId).collect()
}

#[test]
fn long_run_is_split_into_contiguous_chunks() {
    let (model, log) = model(Script::default());
    let mut ctx = model.context(8192, 512);
    let mut window = ContextWindow::new(8192, 4);
    let mut decoder = BatchDecoder::new(512);

    let input = tokens(1200);
    let shifts = decoder
        .decode_in_chunks(&mut ctx, &mut window, &input, true)
        .unwrap();
    assert!(shifts.is_empty());

    let log = log.get();
    assert_eq!(log.decodes.len(), 3); // ceil(1200 / 512)
    let sizes: Vec<_> = log.decodes.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![512, 512, 176]);

    let flat: Vec<_> = log.decodes.iter().flatten().collect();
    for (i, entry) in flat.iter().enumerate() {
        assert_eq!(entry.pos, i as i32, "positions must be contiguous");
        assert_eq!(entry.token, input[i]);
        assert_eq!(entry.seq_id, 0);
        assert_eq!(entry.logits, i == input.len() - 1);
    }
    assert_eq!(window.current_position(), 1200);
}

#[test]
fn no_logit_unless_requested() {
    let (model, log) = model(Script::default());
    let mut ctx = model.context(64, 8);
    let mut window = ContextWindow::new(64, 4);
    let mut decoder = BatchDecoder::new(8);

    decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(10), false)
        .unwrap();
    assert!(log.get().decodes.iter().flatten().all(|e| !e.logits));
}

#[test]
fn empty_input_makes_no_calls() {
    let (model, log) = model(Script::default());
    let mut ctx = model.context(64, 8);
    let mut window = ContextWindow::new(64, 4);
    let mut decoder = BatchDecoder::new(8);

    decoder
        .decode_in_chunks(&mut ctx, &mut window, &[], true)
        .unwrap();
    assert_eq!(log.decode_calls(), 0);
    assert_eq!(window.current_position(), 0);
}

#[test]
fn failing_chunk_stops_the_run() {
    let (model, log) = model(Script::default().failing_at(1));
    let mut ctx = model.context(8192, 512);
    let mut window = ContextWindow::new(8192, 4);
    let mut decoder = BatchDecoder::new(512);

    let err = decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(1500), true)
        .unwrap_err();
    assert!(matches!(err, SessionError::Engine(_)));
    assert_eq!(err.code(), 2);
    assert_eq!(log.decode_calls(), 2, "no chunk may follow a failure");
    assert_eq!(window.current_position(), 512);
}

#[test]
fn chunk_that_would_reach_headroom_shifts_first() {
    let (model, log) = model(Script::default());
    let mut ctx = model.context(32, 8);
    let mut window = ContextWindow::new(32, 4);
    let mut decoder = BatchDecoder::new(8);

    // 4-token system prompt, then 20 more tokens
    decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(4), false)
        .unwrap();
    window.mark_system_prompt();
    decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(20), false)
        .unwrap();
    assert_eq!(window.current_position(), 24);

    // 24 + 8 >= 28: shift discards (24 - 4) / 2 = 10 before decoding
    let shifts = decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(8), true)
        .unwrap();
    assert_eq!(shifts.len(), 1);
    assert_eq!(shifts[0].discarded, 10);
    assert_eq!(window.system_prompt_position(), 4);
    assert_eq!(window.current_position(), 22);

    let log = log.get();
    assert_eq!(
        &log.memory[..],
        &[
            MemoryOp::Remove { p0: 4, p1: 14 },
            MemoryOp::Add {
                p0: 14,
                p1: 24,
                delta: -10
            },
        ]
    );
    // The chunk after the shift starts right behind the retained tokens
    let last = log.decodes.last().unwrap();
    assert_eq!(last[0].pos, 14);
    assert_eq!(last[7].pos, 21);
}

#[test]
fn single_token_decode_advances_by_one() {
    let (model, log) = model(Script::default());
    let mut ctx = model.context(16, 4);
    let mut window = ContextWindow::new(16, 4);
    let mut decoder = BatchDecoder::new(4);

    decoder.decode_single(&mut ctx, &mut window, 65).unwrap();
    decoder.decode_single(&mut ctx, &mut window, 66).unwrap();
    assert_eq!(window.current_position(), 2);

    let log = log.get();
    assert_eq!(log.decodes[1].len(), 1);
    assert_eq!(log.decodes[1][0].pos, 1);
    assert!(log.decodes[1][0].logits);
}

#[test]
fn chunk_too_large_after_shift_is_split() {
    let (model, log) = model(Script::default());
    let mut ctx = model.context(32, 32);
    let mut window = ContextWindow::new(32, 4);
    let mut decoder = BatchDecoder::new(32);

    decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(4), false)
        .unwrap();
    window.mark_system_prompt();
    decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(20), false)
        .unwrap();

    // First shift frees 10 (cur 14): 14 tokens fit, the other 6 need a
    // second shift of (28 - 4) / 2 = 12
    let shifts = decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(20), true)
        .unwrap();
    let discarded: Vec<_> = shifts.iter().map(|s| s.discarded).collect();
    assert_eq!(discarded, vec![10, 12]);
    assert_eq!(window.current_position(), 22);

    let log = log.get();
    let sizes: Vec<_> = log.decodes.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![4, 20, 14, 6]);
    assert!(log.decodes.iter().flatten().all(|e| e.pos < 28));
    assert_eq!(log.decodes[3][0].pos, 16);
    assert!(log.decodes[3][5].logits);
    assert_eq!(log.decodes.iter().flatten().filter(|e| e.logits).count(), 1);
}

#[test]
fn window_held_entirely_by_system_prompt_is_full() {
    let (model, log) = model(Script::default());
    let mut ctx = model.context(16, 16);
    let mut window = ContextWindow::new(16, 4);
    let mut decoder = BatchDecoder::new(16);

    decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(12), false)
        .unwrap();
    window.mark_system_prompt();

    let err = decoder
        .decode_in_chunks(&mut ctx, &mut window, &tokens(1), true)
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::ContextFull {
            position: 12,
            usable: 12
        }
    ));
    assert_eq!(err.code(), 2);
    assert_eq!(log.decode_calls(), 1);
}
