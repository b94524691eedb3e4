use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::graph::UnitStatus;
use crate::phase::PhaseStatus;
use crate::session::Speaker;
use crate::testing::{fixture, test_config, ScriptedLlm};

type Log = Arc<Mutex<Vec<String>>>;

/// Records the generate intents it receives
struct RecordingGenerate(Log);

#[async_trait]
impl Handler for RecordingGenerate {
    async fn handle(
        &self,
        intent: &Intent,
        _session: &SessionSnapshot,
        ctx: &HandlerContext,
    ) -> anyhow::Result<HandlerResult> {
        let planned = ctx.plan.as_ref().map(|p| p.unit_count()).unwrap_or(0);
        self.0.lock().unwrap().push(format!(
            "generate:{} planned={}",
            intent.target.as_deref().unwrap_or("*"),
            planned
        ));
        Ok(HandlerResult::reply("generated"))
    }
}

fn unit(name: &str) -> ContentUnit {
    ContentUnit::new("p1", name)
}

#[tokio::test(start_paused = true)]
async fn test_decomposed_intents_run_strictly_in_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let tool_log = log.clone();
    let mut tools = ToolRegistry::new();
    tools.register_fn("structure", move |args, _project| {
        let log = tool_log.clone();
        async move {
            let target = args
                .get("target")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            log.lock().unwrap().push(format!("edit:{} start", target));
            tokio::time::sleep(Duration::from_millis(50)).await;
            log.lock().unwrap().push(format!("edit:{} done", target));
            Ok(format!("Removed {}", target))
        }
    });

    let fx = fixture(test_config(), ScriptedLlm::new(), vec![unit("X")]);
    let dispatcher = fx
        .dispatcher
        .with_tools(tools)
        .with_handler(IntentKind::Generate, Arc::new(RecordingGenerate(log.clone())));

    let response = dispatcher
        .run_turn(TurnRequest::new("p1", "delete unit X, then generate unit Y"))
        .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert_eq!(response.executed, vec![IntentKind::Edit, IntentKind::Generate]);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["edit:X start", "edit:X done", "generate:Y planned=1"]
    );
    // decomposition needs no model call
    assert_eq!(fx.llm.call_count(), 0);
    // the new target was declared before generation
    assert!(fx.projects.unit("p1", "Y").await.is_some());
}

#[tokio::test]
async fn test_reference_target_is_modified() {
    let units = vec![
        unit("Research").with_content("Notes.").with_status(UnitStatus::Completed),
        unit("Summary").with_content("Short.").with_status(UnitStatus::Completed),
    ];
    let fx = fixture(
        test_config(),
        ScriptedLlm::new().reply_for("modify", "A sharper summary."),
        units,
    );

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "using @Research, rewrite @Summary"))
        .await;

    assert_eq!(response.executed, vec![IntentKind::Modify]);
    assert_eq!(response.produced_unit.unwrap().name, "Summary");
    assert_eq!(
        fx.projects.unit("p1", "Summary").await.unwrap().content,
        "A sharper summary."
    );
    assert_eq!(fx.projects.unit("p1", "Research").await.unwrap().content, "Notes.");
    assert_eq!(fx.llm.purposes(), vec!["modify"]);
}

#[tokio::test]
async fn test_unmet_precondition_stops_the_turn() {
    let research = unit("Research");
    let summary = unit("Summary").depending_on([research.id.clone()]);
    let fx = fixture(test_config(), ScriptedLlm::new(), vec![research, summary]);
    let key = SessionKey::new("p1", "main");

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new(
            "p1",
            "generate unit Summary, then generate unit Appendix",
        ))
        .await;

    let error = response.error.expect("turn should fail");
    assert_eq!(error.code, "precondition_not_met");
    assert_eq!(error.intent_kind, Some(IntentKind::Generate));
    assert!(!error.retryable);
    assert!(error.message.contains("Research"));
    assert!(response.executed.is_empty());
    // the rest of the queue is discarded, not resumable
    assert_eq!(response.discarded.len(), 1);
    assert_eq!(response.discarded[0].target.as_deref(), Some("Appendix"));
    assert!(fx.projects.unit("p1", "Appendix").await.is_none());
    assert!(assert_ok!(fx.sessions.load_checkpoint(&key).await).is_none());
}

#[tokio::test]
async fn test_cycle_is_surfaced() {
    let a = unit("A").depending_on(["p1:b"]);
    let b = unit("B").depending_on(["p1:a"]);
    let fx = fixture(
        test_config(),
        ScriptedLlm::new().reply_for("classifier", r#"{"kind": "gen", "target": "A"}"#),
        vec![a, b],
    );

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "go ahead with A"))
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, "cycle");
    assert!(error.message.contains("p1:a"));
    assert!(error.message.contains("p1:b"));
}

#[tokio::test]
async fn test_human_gate_suspends_after_phase_completion() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("classifier", r#"{"intents": [{"kind": "phase_continue"}]}"#)
            .reply_for(
                "phase",
                r#"{"reply": "Brief written.", "phase_complete": true, "content": "For engineers."}"#,
            ),
        Vec::new(),
    );

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "let's get going"))
        .await;

    assert!(response.waiting_for_human);
    assert_eq!(response.executed, vec![IntentKind::PhaseContinue]);
    assert_eq!(response.phase.as_deref(), Some("brief"));
    assert_eq!(response.phase_status["brief"], PhaseStatus::Completed);
    assert_eq!(response.phase_status["outline"], PhaseStatus::Pending);
    assert_eq!(fx.projects.unit("p1", "brief").await.unwrap().content, "For engineers.");
}

#[tokio::test]
async fn test_autonomous_phase_advances_and_continues() {
    let mut config = test_config();
    config.autonomy.insert("brief".to_string(), true);
    let fx = fixture(
        config,
        ScriptedLlm::new()
            .reply_for("classifier", r#"{"kind": "phase_continue"}"#)
            .reply_for(
                "phase",
                r#"{"reply": "Brief done.", "phase_complete": true, "content": "For engineers."}"#,
            )
            .reply_for(
                "phase",
                r#"{"reply": "How many sections?", "phase_complete": false}"#,
            ),
        Vec::new(),
    );
    let key = SessionKey::new("p1", "main");

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "start"))
        .await;

    assert_eq!(
        response.executed,
        vec![IntentKind::PhaseContinue, IntentKind::PhaseContinue]
    );
    assert!(response.waiting_for_human);
    assert_eq!(response.phase.as_deref(), Some("outline"));
    assert_eq!(response.phase_status["brief"], PhaseStatus::Completed);
    assert_eq!(response.phase_status["outline"], PhaseStatus::InProgress);

    let transcript = fx.sessions.load_transcript(&key).await.unwrap();
    let last = transcript.last().unwrap();
    assert_eq!(last.speaker, Speaker::Assistant);
    assert!(last.scripted_question);
    assert_eq!(last.phase.as_deref(), Some("outline"));
    assert_eq!(last.content, "How many sections?");

    let stored = fx.projects.load_session_state("p1").await.unwrap().unwrap();
    assert_eq!(stored.current(), Some("outline"));
}

#[tokio::test]
async fn test_turn_bound_limits_autonomous_chain() {
    let mut config = test_config();
    config.max_intents_per_turn = 2;
    for phase in ["brief", "outline", "draft"] {
        config.autonomy.insert(phase.to_string(), true);
    }
    let done = r#"{"reply": "Done.", "phase_complete": true, "content": "text"}"#;
    let fx = fixture(
        config,
        ScriptedLlm::new()
            .reply_for("classifier", r#"{"kind": "phase_continue"}"#)
            .reply_for("phase", done)
            .reply_for("phase", done)
            .reply_for("phase", done),
        Vec::new(),
    );

    let response = fx.dispatcher.run_turn(TurnRequest::new("p1", "run it all")).await;

    assert_eq!(response.executed.len(), 2);
    let dropped: Vec<_> = response.discarded.iter().map(|i| i.kind).collect();
    assert_eq!(dropped, vec![IntentKind::PhaseContinue]);
    assert!(response
        .output
        .ends_with("Stopped after 2 intents; not run: phase_continue."));
    assert!(!response.waiting_for_human);
    assert_eq!(response.phase.as_deref(), Some("draft"));
    assert_eq!(response.phase_status["outline"], PhaseStatus::Completed);
}

#[tokio::test]
async fn test_scripted_question_answer_skips_classifier() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new().reply_for(
            "phase",
            r#"{"reply": "What tone?", "phase_complete": false}"#,
        ),
        Vec::new(),
    );
    let key = SessionKey::new("p1", "main");
    fx.sessions
        .append_transcript(&key, &TranscriptEntry::question("Who is the audience?", "brief"))
        .await
        .unwrap();

    let response = fx.dispatcher.run_turn(TurnRequest::new("p1", "Engineers")).await;

    assert_eq!(response.executed, vec![IntentKind::PhaseContinue]);
    assert_eq!(fx.llm.purposes(), vec!["phase"]);
    assert_eq!(response.output, "What tone?");
    assert_eq!(response.phase_status["brief"], PhaseStatus::InProgress);

    let transcript = fx.sessions.load_transcript(&key).await.unwrap();
    let speakers: Vec<_> = transcript.iter().map(|e| e.speaker).collect();
    assert_eq!(
        speakers,
        vec![Speaker::Assistant, Speaker::User, Speaker::Assistant]
    );
}

#[tokio::test]
async fn test_waiting_for_human_discards_queue() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for(
                "classifier",
                r#"[{"kind": "phase_continue"}, {"kind": "generate", "target": "Intro"}]"#,
            )
            .reply_for("phase", r#"{"reply": "Who reads this?", "phase_complete": false}"#),
        Vec::new(),
    );

    let response = fx.dispatcher.run_turn(TurnRequest::new("p1", "hello there")).await;

    assert!(response.waiting_for_human);
    assert_eq!(response.executed, vec![IntentKind::PhaseContinue]);
    assert_eq!(response.discarded.len(), 1);
    assert_eq!(response.discarded[0].target.as_deref(), Some("Intro"));
    assert!(fx.projects.unit("p1", "Intro").await.is_none());
    assert!(fx
        .sessions
        .load_checkpoint(&SessionKey::new("p1", "main"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_salvages_and_keeps_checkpoint() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("modify", "one two three four five six")
            .with_delay(Duration::from_secs(2)),
        vec![unit("Summary").with_content("old").with_status(UnitStatus::Completed)],
    );
    let key = SessionKey::new("p1", "main");

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "shorten @Summary"))
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, "timeout");
    assert!(error.retryable);
    assert_eq!(error.intent_kind, Some(IntentKind::Modify));

    // chunks at 2s and 4s arrived before the 5s deadline
    let summary = fx.projects.unit("p1", "Summary").await.unwrap();
    assert_eq!(summary.content, "one two ");
    assert_eq!(summary.status, UnitStatus::InProgress);

    let checkpoint = fx.sessions.load_checkpoint(&key).await.unwrap().unwrap();
    assert_eq!(checkpoint.pending.len(), 1);
    assert_eq!(checkpoint.pending[0].kind, IntentKind::Modify);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_salvages_then_resume_finishes() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("modify", "a much tighter summary")
            .reply_for("modify", "the resumed summary")
            .with_delay(Duration::from_millis(100)),
        vec![unit("Summary").with_content("old").with_status(UnitStatus::Completed)],
    );
    let key = SessionKey::new("p1", "main");
    let (tx, mut rx) = mpsc::channel::<TurnEvent>(64);
    let cancel = CancellationToken::new();

    let consumer = {
        let cancel = cancel.clone();
        async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                if event.kind == TurnEventKind::Token {
                    cancel.cancel();
                }
                events.push(event);
            }
            events
        }
    };
    let (response, events) = tokio::join!(
        fx.dispatcher
            .run_turn_streaming(TurnRequest::new("p1", "tighten @Summary"), tx, cancel.clone()),
        consumer
    );

    assert_eq!(response.error_code(), Some("cancelled"));
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&TurnEventKind::Route));
    assert_eq!(kinds.last(), Some(&TurnEventKind::Error));
    assert!(kinds.contains(&TurnEventKind::Token));
    let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let salvaged = fx.projects.unit("p1", "Summary").await.unwrap();
    assert_eq!(salvaged.content, "a ");
    assert_eq!(salvaged.status, UnitStatus::InProgress);
    assert_eq!(fx.projects.snapshots().await[0].content, "old");

    let resumed = fx.dispatcher.resume_turn(&key).await;
    assert!(resumed.error.is_none(), "{:?}", resumed.error);
    assert_eq!(resumed.executed, vec![IntentKind::Modify]);
    let summary = fx.projects.unit("p1", "Summary").await.unwrap();
    assert_eq!(summary.content, "the resumed summary");
    assert_eq!(summary.status, UnitStatus::Completed);
    assert!(fx.sessions.load_checkpoint(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stream_announces_route_before_output() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("classifier", r#"{"kind": "talk"}"#)
            .reply_for("chat", "Hello there friend"),
        Vec::new(),
    );
    let (tx, mut rx) = mpsc::channel(64);

    let response = fx
        .dispatcher
        .run_turn_streaming(TurnRequest::new("p1", "hi"), tx, CancellationToken::new())
        .await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(response.output, "Hello there friend");
    assert_eq!(events[0].kind, TurnEventKind::Route);
    assert_eq!(events[0].intent_kind, Some(IntentKind::Chat));
    let text: String = events.iter().filter_map(|e| e.text()).collect();
    assert_eq!(text, "Hello there friend");
    assert_eq!(events.last().unwrap().kind, TurnEventKind::Done);
}

#[tokio::test]
async fn test_generate_without_target_reports_blocked() {
    let intro = unit("Intro").with_status(UnitStatus::Completed).with_content("Hi.");
    let body = unit("Body").depending_on([intro.id.clone()]);
    let orphan = unit("Orphan").depending_on(["p1:nowhere"]);
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("classifier", r#"{"kind": "generate", "target": null}"#)
            .reply_for("generate", "Body text."),
        vec![intro, body, orphan],
    );
    let (tx, mut rx) = mpsc::channel(64);

    let response = fx
        .dispatcher
        .run_turn_streaming(
            TurnRequest::new("p1", "fill in whatever is missing"),
            tx,
            CancellationToken::new(),
        )
        .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert!(response.output.contains("Orphan (missing p1:nowhere)"));
    assert_eq!(fx.projects.unit("p1", "Body").await.unwrap().content, "Body text.");
    assert_eq!(fx.projects.unit("p1", "Orphan").await.unwrap().status, UnitStatus::Pending);

    let mut content_events = 0;
    while let Some(event) = rx.recv().await {
        if event.kind == TurnEventKind::Content {
            content_events += 1;
        }
    }
    // in_progress then completed
    assert_eq!(content_events, 2);
}

#[tokio::test]
async fn test_unknown_request_phase_is_rejected() {
    let fx = fixture(test_config(), ScriptedLlm::new(), Vec::new());
    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "hi").with_phase("P9"))
        .await;
    assert_eq!(response.error_code(), Some("unknown_phase"));
    assert_eq!(fx.llm.call_count(), 0);
}

#[tokio::test]
async fn test_advance_to_named_phase() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("classifier", r#"{"kind": "next_phase", "target": "draft"}"#)
            .reply_for("phase", r#"{"reply": "Which section first?", "phase_complete": false}"#),
        Vec::new(),
    );

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "skip ahead to drafting"))
        .await;

    assert_eq!(
        response.executed,
        vec![IntentKind::AdvancePhase, IntentKind::PhaseContinue]
    );
    assert_eq!(response.phase.as_deref(), Some("draft"));
    assert_eq!(response.phase_status["brief"], PhaseStatus::Completed);
    assert_eq!(response.phase_status["outline"], PhaseStatus::Pending);
    assert!(response.waiting_for_human);
}

#[tokio::test]
async fn test_set_autonomy_persists() {
    let fx = fixture(test_config(), ScriptedLlm::new(), Vec::new());
    let phases = fx.dispatcher.set_autonomy("p1", "outline", true).await.unwrap();
    assert!(phases.is_autonomous("outline"));

    let reloaded = fx.dispatcher.load_phases("p1").await.unwrap();
    assert!(reloaded.is_autonomous("outline"));
    assert!(!reloaded.is_autonomous("brief"));

    let err = fx.dispatcher.set_autonomy("p1", "P9", true).await.unwrap_err();
    assert_eq!(err.code(), "unknown_phase");
}

#[tokio::test]
async fn test_generating_a_colliding_name_keeps_existing_unit() {
    let existing = unit("Intro Part")
        .with_content("keep me")
        .with_status(UnitStatus::Completed);
    let existing_id = existing.id.clone();
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("classifier", r#"{"kind": "generate", "target": "Intro_Part"}"#)
            .reply_for("generate", "new text"),
        vec![existing],
    );

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "now the other intro part"))
        .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    let units = fx.projects.load_units("p1").await.unwrap();
    let kept = units.iter().find(|u| u.id == existing_id).unwrap();
    assert_eq!(kept.name, "Intro Part");
    assert_eq!(kept.content, "keep me");

    let created = units.iter().find(|u| u.name == "Intro_Part").unwrap();
    assert_ne!(created.id, existing_id);
    assert_eq!(created.content, "new text");
    assert!(fx.projects.snapshots().await.is_empty());
}

#[tokio::test]
async fn test_unknown_reference_in_sequence_answers_in_chat() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new().reply_for("chat", "There is no Ghost unit yet."),
        vec![unit("Summary").with_content("Short.")],
    );
    let key = SessionKey::new("p1", "main");

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "rewrite @Ghost, then generate unit Y"))
        .await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert_eq!(response.executed, vec![IntentKind::Chat]);
    assert_eq!(fx.llm.purposes(), vec!["chat"]);
    let note = &fx.llm.calls()[0].messages;
    assert!(note.iter().any(|m| m.content.contains("Ghost")));
    assert!(fx.projects.unit("p1", "Y").await.is_none());
    assert!(fx.sessions.load_checkpoint(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_question_about_unit_does_not_rewrite_it() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new()
            .reply_for("query", "It covers three studies.")
            .reply_for("modify", "REWRITTEN"),
        vec![unit("Summary")
            .with_content("A long summary.")
            .with_status(UnitStatus::Completed)],
    );

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "why is @Summary so long?"))
        .await;

    assert_eq!(response.executed, vec![IntentKind::Query]);
    assert_eq!(fx.llm.purposes(), vec!["query"]);
    assert_eq!(
        fx.projects.unit("p1", "Summary").await.unwrap().content,
        "A long summary."
    );
    assert!(fx.projects.snapshots().await.is_empty());
}

#[tokio::test]
async fn test_failed_generation_is_retryable_and_resumable() {
    let fx = fixture(
        test_config(),
        ScriptedLlm::new().fail_for("generate", "provider down"),
        vec![unit("Intro")],
    );
    let key = SessionKey::new("p1", "main");

    let response = fx
        .dispatcher
        .run_turn(TurnRequest::new("p1", "generate unit Intro, then generate unit Outro"))
        .await;

    let error = response.error.unwrap();
    assert_eq!(error.code, "handler_execution");
    assert!(error.retryable);
    assert!(error.message.contains("provider down"));
    assert!(response.discarded.is_empty());
    assert_eq!(
        fx.projects.unit("p1", "Intro").await.unwrap().status,
        UnitStatus::Failed
    );

    let checkpoint = fx.sessions.load_checkpoint(&key).await.unwrap().unwrap();
    let pending: Vec<_> = checkpoint
        .pending
        .iter()
        .map(|i| i.target.as_deref())
        .collect();
    assert_eq!(pending, vec![Some("Intro"), Some("Outro")]);
}
