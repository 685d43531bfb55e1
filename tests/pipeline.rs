//! End-to-end pipeline runs over deterministic fakes.

mod common;

use async_trait::async_trait;
use common::*;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use transcritor::error::{ErrorClass, ExternalError, PageError, PipelineError};
use transcritor::pipeline::chunk::metadata_page_index;
use transcritor::pipeline::embed::Embedder;
use transcritor::{PipelineConfig, PipelineObserver, PipelineStage, RetryPolicy, SourceDocument, VectorStore};

#[tokio::test]
async fn two_page_document_is_chunked_embedded_and_stored() {
    let h = harness(2, ScriptedExtractor::healthy());
    let doc = SourceDocument::new(pdf_bytes("two-pages"), Some("ficha.pdf".into()));

    let result = h.pipeline.process(&doc).await.expect("document stored");

    assert_eq!(result.total_pages, 2);
    assert!(result.chunks_added >= 2, "got {}", result.chunks_added);
    assert_eq!(result.chunks_added, result.chunks_produced);
    assert_eq!(result.chunks_inserted, result.chunks_added);
    assert!(result.warnings.is_empty());
    assert_eq!(result.filename.as_deref(), Some("ficha.pdf"));

    let stored = h.store.chunks_for_file(doc.file_id()).await.unwrap();
    assert_eq!(stored.len(), result.chunks_added);
    let pages: BTreeSet<usize> = stored
        .iter()
        .filter_map(|c| metadata_page_index(&c.metadata))
        .collect();
    assert_eq!(pages, BTreeSet::from([0, 1]));
    for c in &stored {
        assert_eq!(c.metadata["source_file"], "ficha.pdf");
        assert_eq!(c.metadata["fields_parsed"], true);
        assert_eq!(c.metadata["client_name"], "Maria Silva");
        assert_eq!(c.metadata["signature_found"], true);
        assert!(c.text.chars().count() <= 1000);
    }
}

#[tokio::test]
async fn rerunning_a_document_updates_instead_of_duplicating() {
    let h = harness(3, ScriptedExtractor::healthy());
    let doc = SourceDocument::new(pdf_bytes("rerun"), None);

    let first = h.pipeline.process(&doc).await.unwrap();
    let count_after_first = h.store.count().await.unwrap();
    let ids_after_first = h.store.chunk_ids_for_file(doc.file_id()).await.unwrap();

    let second = h.pipeline.process(&doc).await.unwrap();

    assert_eq!(second.chunks_inserted, 0);
    assert_eq!(second.chunks_updated, first.chunks_added);
    assert_eq!(h.store.count().await.unwrap(), count_after_first);
    assert_eq!(
        h.store.chunk_ids_for_file(doc.file_id()).await.unwrap(),
        ids_after_first
    );
}

#[tokio::test]
async fn a_changed_transcription_replaces_rows_instead_of_adding() {
    // Vision models do not transcribe the same page identically twice.
    let extractor = ScriptedExtractor::new(|page, attempt| {
        if attempt == 0 {
            Ok(page_text(page))
        } else {
            Ok(format!("Obs: {}", page_text(page)))
        }
    });
    let h = harness(2, extractor);
    let doc = SourceDocument::new(pdf_bytes("retranscribed"), None);

    let first = h.pipeline.process(&doc).await.unwrap();
    let count_after_first = h.store.count().await.unwrap();
    let second = h.pipeline.process(&doc).await.unwrap();

    assert_eq!(count_after_first, first.chunks_added);
    assert_eq!(h.store.count().await.unwrap(), count_after_first);
    assert_eq!(second.chunks_inserted, 0);
    assert_eq!(second.chunks_removed, 0);
    let stored = h.store.chunks_for_file(doc.file_id()).await.unwrap();
    assert!(stored.iter().all(|c| c.char_offset > 0 || c.text.starts_with("Obs: ")));
}

#[tokio::test]
async fn a_shorter_transcription_drops_its_old_tail_but_failed_pages_keep_rows() {
    let extractor = ScriptedExtractor::new(|page, attempt| match (page, attempt) {
        (_, 0) => Ok(page_text(page)),
        (0, _) => Ok("Obs: sem alterações desde a última consulta.".to_string()),
        _ => Err(ExternalError::Permanent("400 image could not be decoded".into())),
    });
    let h = harness(2, extractor);
    let doc = SourceDocument::new(pdf_bytes("shrunk"), None);

    h.pipeline.process(&doc).await.unwrap();
    let before = h.store.chunks_for_file(doc.file_id()).await.unwrap();
    let page1_before: Vec<_> = before.iter().filter(|c| c.page_index == 1).cloned().collect();
    let page0_before = before.len() - page1_before.len();
    assert!(page0_before >= 2);

    let second = h.pipeline.process(&doc).await.unwrap();

    assert_eq!(second.chunks_added, 1);
    assert_eq!(second.chunks_removed, page0_before - 1);
    assert_eq!(second.warned_pages(), vec![1]);
    let after = h.store.chunks_for_file(doc.file_id()).await.unwrap();
    assert_eq!(after.len(), 1 + page1_before.len());
    let page1_after: Vec<_> = after.iter().filter(|c| c.page_index == 1).cloned().collect();
    assert_eq!(page1_after, page1_before);
}

#[tokio::test]
async fn chunk_ids_do_not_depend_on_the_pipeline_instance() {
    let doc = SourceDocument::new(pdf_bytes("determinism"), None);

    let a = harness(3, ScriptedExtractor::healthy());
    a.pipeline.process(&doc).await.unwrap();
    let b = harness(3, ScriptedExtractor::healthy());
    b.pipeline.process(&doc).await.unwrap();

    let ids_a = a.store.chunk_ids_for_file(doc.file_id()).await.unwrap();
    let ids_b = b.store.chunk_ids_for_file(doc.file_id()).await.unwrap();
    assert!(!ids_a.is_empty());
    assert_eq!(ids_a, ids_b);
}

#[tokio::test]
async fn chunks_reach_the_store_in_page_order_whatever_finishes_first() {
    // Later pages answer faster, so completion order is reversed.
    let extractor = ScriptedExtractor::healthy()
        .with_delay(|page, _| Duration::from_millis(10 * (6 - page as u64)));
    let h = harness(6, extractor);

    h.pipeline.process_pdf_pipeline(pdf_bytes("ordering")).await.unwrap();

    let upserts = h.store.upsert_pages.lock().unwrap().clone();
    assert_eq!(upserts.len(), 1, "one upsert per document");
    let pages = &upserts[0];
    assert!(pages.windows(2).all(|w| w[0] <= w[1]), "got {:?}", pages);
    let distinct: BTreeSet<usize> = pages.iter().copied().collect();
    assert_eq!(distinct, (0..6).collect());
}

#[tokio::test]
async fn a_permanently_failing_page_becomes_a_warning() {
    let extractor = ScriptedExtractor::new(|page, _| {
        if page == 2 {
            Err(ExternalError::Permanent("400 image could not be decoded".into()))
        } else {
            Ok(page_text(page))
        }
    });
    let h = harness(5, extractor);
    let doc = SourceDocument::new(pdf_bytes("bad-page"), None);

    let result = h.pipeline.process(&doc).await.expect("other pages stored");

    assert_eq!(result.warned_pages(), vec![2]);
    assert!(matches!(
        result.warnings[0].error,
        PageError::ExtractionFailed { page: 2, retries: 0, transient: false, .. }
    ));
    assert_eq!(result.pages_with_text(), 4);
    assert_eq!(h.extractor.calls_for(2), 1, "permanent errors are not retried");

    let pages: BTreeSet<usize> = h
        .store
        .chunks_for_file(doc.file_id())
        .await
        .unwrap()
        .iter()
        .map(|c| c.page_index)
        .collect();
    assert_eq!(pages, BTreeSet::from([0, 1, 3, 4]));
}

#[tokio::test]
async fn transient_extraction_failures_are_retried() {
    let extractor = ScriptedExtractor::new(|page, attempt| {
        if page == 0 && attempt < 2 {
            Err(ExternalError::Transient("503 Service Unavailable".into()))
        } else {
            Ok(page_text(page))
        }
    });
    let h = harness(2, extractor);

    let result = h.pipeline.process_pdf_pipeline(pdf_bytes("flaky")).await.unwrap();

    assert!(result.warnings.is_empty());
    assert_eq!(h.extractor.calls_for(0), 3);
    assert_eq!(h.extractor.calls_for(1), 1);
    assert_eq!(result.stats.external_retries, 2);
}

#[tokio::test]
async fn every_page_failing_fails_the_document_and_stores_nothing() {
    let extractor = ScriptedExtractor::new(|_, _| Err(ExternalError::Permanent("401 Unauthorized".into())));
    let h = harness(3, extractor);

    let err = h
        .pipeline
        .process_pdf_pipeline(pdf_bytes("all-bad"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::AllPagesFailed { total: 3, transient: false, .. }));
    assert_eq!(err.class(), ErrorClass::PermanentExternal);
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn blank_pages_do_not_hide_an_extraction_outage() {
    let extractor = ScriptedExtractor::new(|page, _| {
        if page == 0 {
            Ok(String::new())
        } else {
            Err(ExternalError::Transient("503".into()))
        }
    });
    let h = harness(3, extractor);

    let err = h
        .pipeline
        .process_pdf_pipeline(pdf_bytes("blank-then-outage"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::AllPagesFailed { total: 3, transient: true, .. }));
    assert_eq!(err.class(), ErrorClass::TransientExternal);
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn an_all_blank_document_succeeds_with_no_chunks() {
    let h = harness(2, ScriptedExtractor::new(|_, _| Ok("  \n ".to_string())));

    let result = h.pipeline.process_pdf_pipeline(pdf_bytes("all-blank")).await.unwrap();

    assert_eq!(result.chunks_added, 0);
    assert!(result.warnings.is_empty());
}

#[tokio::test]
async fn a_slow_page_times_out() {
    let config = PipelineConfig {
        api_timeout_secs: 1,
        call_retry: RetryPolicy::none(),
        ..test_config()
    };
    let extractor = ScriptedExtractor::healthy().with_delay(|page, _| {
        if page == 1 {
            Duration::from_secs(3)
        } else {
            Duration::ZERO
        }
    });
    let h = harness_with(
        2,
        extractor,
        FakeParser::ok(),
        Arc::new(HashEmbedder::new()),
        RecordingStore::new(),
        config,
    );

    let result = h.pipeline.process_pdf_pipeline(pdf_bytes("slow")).await.unwrap();

    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].error, PageError::Timeout { page: 1, secs: 1 });
    assert!(result.warnings[0].error.is_transient());
    assert!(result.chunks_added > 0);
}

#[tokio::test]
async fn empty_payload_is_invalid_input() {
    let h = harness(1, ScriptedExtractor::healthy());

    let err = h.pipeline.process_pdf_pipeline(Vec::<u8>::new()).await.unwrap_err();

    assert!(matches!(err, PipelineError::EmptyPayload));
    assert_eq!(err.class(), ErrorClass::InvalidInput);
    assert_eq!(h.extractor.calls_for(0), 0);
}

#[tokio::test]
async fn unparseable_fields_keep_the_text_without_fields() {
    let h = harness_with(
        2,
        ScriptedExtractor::healthy(),
        FakeParser { broken: vec![1] },
        Arc::new(HashEmbedder::new()),
        RecordingStore::new(),
        test_config(),
    );
    let doc = SourceDocument::new(pdf_bytes("prose-answer"), None);

    let result = h.pipeline.process(&doc).await.unwrap();

    assert_eq!(result.warned_pages(), vec![1]);
    assert!(matches!(result.warnings[0].error, PageError::ParsingFailed { page: 1, .. }));
    assert_eq!(result.pages_with_text(), 2);

    for c in h.store.chunks_for_file(doc.file_id()).await.unwrap() {
        if c.page_index == 1 {
            assert_eq!(c.metadata["fields_parsed"], false);
            assert!(c.metadata["client_name"].is_null());
        } else {
            assert_eq!(c.metadata["fields_parsed"], true);
        }
    }
}

struct WrongDimension;

#[async_trait]
impl Embedder for WrongDimension {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
        Ok(texts.iter().map(|_| vec![0.5; DIM + 1]).collect())
    }
}

#[tokio::test]
async fn wrong_embedding_dimension_stores_nothing() {
    let h = harness_with(
        2,
        ScriptedExtractor::healthy(),
        FakeParser::ok(),
        Arc::new(WrongDimension),
        RecordingStore::new(),
        test_config(),
    );

    let err = h
        .pipeline
        .process_pdf_pipeline(pdf_bytes("dimension"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::DimensionMismatch { expected: DIM, actual, .. } if actual == DIM + 1
    ));
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn transient_embedding_failure_is_classified_for_task_retry() {
    let embedder = Arc::new(RateLimitedEmbedder {
        requests: Default::default(),
    });
    let h = harness_with(
        1,
        ScriptedExtractor::healthy(),
        FakeParser::ok(),
        embedder.clone(),
        RecordingStore::new(),
        test_config(),
    );

    let err = h
        .pipeline
        .process_pdf_pipeline(pdf_bytes("rate-limited"))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::TransientExternal);
    let PipelineError::Embedding { chunk_ids, .. } = err else {
        panic!("expected an embedding error");
    };
    assert!(chunk_ids.len() >= 2);
    // The batch, then each chunk alone; every call gets 1 + 3 attempts.
    assert_eq!(
        embedder.requests.load(Ordering::SeqCst),
        4 * (1 + chunk_ids.len())
    );
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[derive(Default)]
struct Events {
    stages: Mutex<Vec<PipelineStage>>,
    pages_ready: Mutex<Option<usize>>,
    completed: Mutex<Vec<usize>>,
    warnings: Mutex<Vec<usize>>,
}

impl PipelineObserver for Events {
    fn on_stage(&self, stage: PipelineStage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_pages_ready(&self, total_pages: usize) {
        *self.pages_ready.lock().unwrap() = Some(total_pages);
    }

    fn on_page_complete(&self, page_index: usize, _total_pages: usize, _chunks: usize) {
        self.completed.lock().unwrap().push(page_index);
    }

    fn on_page_warning(&self, page_index: usize, _total_pages: usize, _warning: &str) {
        self.warnings.lock().unwrap().push(page_index);
    }
}

#[tokio::test]
async fn observer_sees_stages_pages_and_warnings() {
    let extractor = ScriptedExtractor::new(|page, _| {
        if page == 1 {
            Err(ExternalError::Permanent("bad image".into()))
        } else {
            Ok(page_text(page))
        }
    });
    let h = harness(3, extractor);
    let events = Arc::new(Events::default());
    let pipeline = h.pipeline.with_observer(events.clone());

    pipeline.process_pdf_pipeline(pdf_bytes("observed")).await.unwrap();

    assert_eq!(
        *events.stages.lock().unwrap(),
        vec![
            PipelineStage::Splitting,
            PipelineStage::Embedding,
            PipelineStage::Storing,
            PipelineStage::Done
        ]
    );
    assert_eq!(*events.pages_ready.lock().unwrap(), Some(3));
    let mut completed = events.completed.lock().unwrap().clone();
    completed.sort_unstable();
    assert_eq!(completed, vec![0, 1, 2]);
    assert_eq!(*events.warnings.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn stored_chunks_are_searchable() {
    let h = harness(2, ScriptedExtractor::healthy());
    let doc = SourceDocument::new(pdf_bytes("search"), None);
    h.pipeline.process(&doc).await.unwrap();

    let query = h.store.chunks_for_file(doc.file_id()).await.unwrap()[0]
        .text
        .clone();
    let hits = h.pipeline.search(&query, 3).await.unwrap();

    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].chunk.text, query);
    assert!(hits[0].score >= hits[1].score);
}
