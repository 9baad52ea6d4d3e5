//! Task graphs for fee estimation and submission
//!
//! Every graph starts from the current runtime metadata and a build strategy,
//! and ends in a single target unit:
//! - fee estimation: metadata + build -> encode (zero signature) -> query fee
//! - submission: metadata + build -> sign -> submit
//! - watched submission: metadata + build -> sign -> submit and watch
//! - indexed forms repeat the per-item units and aggregate in index order

use super::builder::{BuildStrategy, ExtrinsicBuilder, IndexedBuildStrategy};
use super::codec;
use super::types::{AccountId, CryptoType, ExtrinsicHash, FeeInfo, MultiSignature};
use crate::chain::{await_terminal, RpcEngine};
use crate::config::{BatchErrorMode, ExtrinsicConfig};
use crate::coordination::dependency::{Dependency, GraphBuilder, TaskGraph};
use crate::error::{ExtrinsicError, ExtrinsicResult};
use crate::runtime::{MetadataProvider, RuntimeMetadata};
use crate::signer::Signer;

use futures::future::{join_all, try_join_all};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

type MetadataDependency = Dependency<Arc<RuntimeMetadata>>;

/// Builds task graphs against one account and one node
pub struct ExtrinsicOperationFactory {
    /// Account fee estimates are computed for
    account_id: AccountId,
    /// Signature scheme of that account
    crypto_type: CryptoType,
    /// Source of encoding metadata
    metadata: Arc<dyn MetadataProvider>,
    /// Node connection
    engine: Arc<dyn RpcEngine>,
    config: ExtrinsicConfig,
}

impl ExtrinsicOperationFactory {
    pub fn new(
        account_id: AccountId,
        crypto_type: CryptoType,
        metadata: Arc<dyn MetadataProvider>,
        engine: Arc<dyn RpcEngine>,
        config: ExtrinsicConfig,
    ) -> Self {
        Self {
            account_id,
            crypto_type,
            metadata,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &ExtrinsicConfig {
        &self.config
    }

    /// Graph resolving to the fee of one unsigned extrinsic.
    ///
    /// Nothing is signed or broadcast; the extrinsic carries a zero-valued
    /// signature so the node accepts its shape.
    pub fn estimate_fee_graph<B: BuildStrategy>(&self, strategy: B) -> TaskGraph<FeeInfo> {
        let mut graph = GraphBuilder::new();
        let metadata = self.add_metadata(&mut graph);
        let built = graph.add("build", build_single(strategy));

        let encoded = self.add_fee_encoding(&mut graph, "encode", metadata, built);
        let engine = self.engine.clone();
        graph.finish("query_fee", async move {
            let extrinsic = encoded.await?;
            engine.query_fee(&extrinsic).await
        })
    }

    /// Graph resolving to `count` fees in index order.
    ///
    /// All payloads come from one build unit, so a builder failure fails the
    /// whole batch. Fee queries run independently of each other.
    pub fn estimate_fee_batch_graph<B: IndexedBuildStrategy>(
        &self,
        strategy: B,
        count: NonZeroUsize,
    ) -> TaskGraph<Vec<ExtrinsicResult<FeeInfo>>> {
        let mut graph = GraphBuilder::new();
        let metadata = self.add_metadata(&mut graph);
        let built = graph.add("build", build_indexed(strategy, count));

        let mut queries = Vec::with_capacity(count.get());
        for index in 0..count.get() {
            let item = graph.add(format!("item[{}]", index), select_builder(built.clone(), index));
            let encoded =
                self.add_fee_encoding(&mut graph, &format!("encode[{}]", index), metadata.clone(), item);

            let engine = self.engine.clone();
            queries.push(graph.add(format!("query_fee[{}]", index), async move {
                let extrinsic = encoded.await?;
                engine.query_fee(&extrinsic).await
            }));
        }

        let mode = self.config.batch_errors;
        graph.finish("aggregate_fees", async move {
            built.await?;
            aggregate(mode, queries).await
        })
    }

    /// Graph that signs and submits once, resolving on node acceptance
    pub fn submission_graph<B: BuildStrategy>(
        &self,
        strategy: B,
        signer: Arc<dyn Signer>,
    ) -> TaskGraph<ExtrinsicHash> {
        let mut graph = GraphBuilder::new();
        let metadata = self.add_metadata(&mut graph);
        let built = graph.add("build", build_single(strategy));
        let signed = add_signing(&mut graph, "sign", metadata, built, signer);

        let engine = self.engine.clone();
        graph.finish("submit", async move {
            let extrinsic = signed.await?;
            let hash = engine.submit(&codec::to_hex(&extrinsic)).await?;
            info!("Extrinsic accepted by node: {}", hash);
            Ok(hash)
        })
    }

    /// Graph that signs, submits, and waits for the configured watch policy.
    ///
    /// Resolves to the locally computed extrinsic hash. The subscription is
    /// closed once the watch ends, including when the graph is cancelled.
    pub fn watch_submission_graph<B: BuildStrategy>(
        &self,
        strategy: B,
        signer: Arc<dyn Signer>,
    ) -> TaskGraph<ExtrinsicHash> {
        let mut graph = GraphBuilder::new();
        let metadata = self.add_metadata(&mut graph);
        let built = graph.add("build", build_single(strategy));
        let signed = add_signing(&mut graph, "sign", metadata, built, signer);

        let engine = self.engine.clone();
        let policy = self.config.watch_policy;
        let watch_timeout = self.config.watch_timeout();
        graph.finish("submit_and_watch", async move {
            let extrinsic = signed.await?;
            let hash = codec::extrinsic_hash(&extrinsic);

            let subscription = engine.submit_and_watch(&codec::to_hex(&extrinsic)).await?;
            let unwatch = UnwatchGuard::new(engine.clone(), subscription.id.clone());
            debug!("Watching extrinsic {} on subscription {}", hash, subscription.id);

            let watched =
                tokio::time::timeout(watch_timeout, await_terminal(subscription.events, policy)).await;
            unwatch.close().await;

            let block = watched.map_err(|_| ExtrinsicError::Timeout {
                operation: format!("status of extrinsic {}", hash),
            })??;
            info!("Extrinsic {} included in block {}", hash, block);
            Ok(hash)
        })
    }

    /// Graph broadcasting `count` extrinsics, resolving to one result per index.
    ///
    /// All payloads are built by one unit before anything is signed, so a
    /// builder failure fails the whole batch with nothing broadcast. Under
    /// `FailFast` every payload is also signed before the first broadcast.
    /// Once broadcasting starts each slot carries its own submit outcome, so
    /// a node rejection at one index never hides the hashes of the others.
    pub fn submission_batch_graph<B: IndexedBuildStrategy>(
        &self,
        strategy: B,
        signer: Arc<dyn Signer>,
        count: NonZeroUsize,
    ) -> TaskGraph<Vec<ExtrinsicResult<ExtrinsicHash>>> {
        let mut graph = GraphBuilder::new();
        let metadata = self.add_metadata(&mut graph);
        let built = graph.add("build", build_indexed(strategy, count));

        let mut signatures = Vec::with_capacity(count.get());
        for index in 0..count.get() {
            let item = graph.add(format!("item[{}]", index), select_builder(built.clone(), index));
            signatures.push(add_signing(
                &mut graph,
                &format!("sign[{}]", index),
                metadata.clone(),
                item,
                signer.clone(),
            ));
        }

        let mode = self.config.batch_errors;
        let all_signed = match mode {
            BatchErrorMode::FailFast => {
                let signatures = signatures.clone();
                Some(graph.add("sign_all", async move {
                    try_join_all(signatures).await.map(|_| ())
                }))
            }
            BatchErrorMode::PerItem => None,
        };

        let mut submissions = Vec::with_capacity(count.get());
        for (index, signed) in signatures.into_iter().enumerate() {
            let engine = self.engine.clone();
            let all_signed = all_signed.clone();
            submissions.push(graph.add(format!("submit[{}]", index), async move {
                if let Some(all_signed) = all_signed {
                    all_signed.await?;
                }
                let extrinsic = signed.await?;
                engine.submit(&codec::to_hex(&extrinsic)).await
            }));
        }

        graph.finish("aggregate_submissions", async move {
            metadata.await?;
            built.await?;
            if let Some(all_signed) = all_signed {
                all_signed.await?;
            }
            let results = join_all(submissions).await;
            let accepted = results.iter().filter(|result| result.is_ok()).count();
            debug!("Batch settled: {} of {} submissions accepted", accepted, results.len());
            Ok(results)
        })
    }

    fn add_metadata(&self, graph: &mut GraphBuilder) -> MetadataDependency {
        let provider = self.metadata.clone();
        graph.add("metadata", async move { provider.fetch_metadata().await })
    }

    /// Encode a fee-estimation extrinsic with a zero signature from this account
    fn add_fee_encoding(
        &self,
        graph: &mut GraphBuilder,
        name: &str,
        metadata: MetadataDependency,
        built: Dependency<ExtrinsicBuilder>,
    ) -> Dependency<String> {
        let account_id = self.account_id;
        let signature = MultiSignature::zeroed(self.crypto_type);
        graph.add(name, async move {
            let metadata = metadata.await?;
            let builder = built.await?;
            let extrinsic = codec::encode_signed(&metadata, &builder, &account_id, &signature)?;
            Ok(codec::to_hex(&extrinsic))
        })
    }
}

fn add_signing(
    graph: &mut GraphBuilder,
    name: &str,
    metadata: MetadataDependency,
    built: Dependency<ExtrinsicBuilder>,
    signer: Arc<dyn Signer>,
) -> Dependency<Vec<u8>> {
    graph.add(name, async move {
        let metadata = metadata.await?;
        let builder = built.await?;
        sign_and_encode(&metadata, &builder, signer.as_ref()).await
    })
}

async fn sign_and_encode(
    metadata: &RuntimeMetadata,
    builder: &ExtrinsicBuilder,
    signer: &dyn Signer,
) -> ExtrinsicResult<Vec<u8>> {
    let payload = codec::signing_payload(metadata, builder)?;
    let signature = signer.sign(&payload).await?;
    if signature.crypto_type() != signer.crypto_type() {
        return Err(ExtrinsicError::Signing(format!(
            "signer declared {:?} but produced a {:?} signature",
            signer.crypto_type(),
            signature.crypto_type()
        )));
    }
    codec::encode_signed(metadata, builder, &signer.account_id(), &signature)
}

/// Closes a watch subscription exactly once, however the watching unit exits
struct UnwatchGuard {
    engine: Arc<dyn RpcEngine>,
    subscription_id: Option<String>,
}

impl UnwatchGuard {
    fn new(engine: Arc<dyn RpcEngine>, subscription_id: String) -> Self {
        Self {
            engine,
            subscription_id: Some(subscription_id),
        }
    }

    async fn close(mut self) {
        if let Some(id) = self.subscription_id.take() {
            unsubscribe(self.engine.as_ref(), &id).await;
        }
    }
}

impl Drop for UnwatchGuard {
    fn drop(&mut self) {
        let Some(id) = self.subscription_id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Watch on {} aborted, unsubscribing in background", id);
                let engine = self.engine.clone();
                runtime.spawn(async move { unsubscribe(engine.as_ref(), &id).await });
            }
            Err(_) => warn!("No runtime to close subscription {}", id),
        }
    }
}

async fn unsubscribe(engine: &dyn RpcEngine, subscription_id: &str) {
    if let Err(e) = engine.unsubscribe(subscription_id).await {
        warn!("Failed to unsubscribe {}: {}", subscription_id, e);
    }
}

/// The `index`-th builder of a shared build
async fn select_builder(
    built: Dependency<Arc<Vec<ExtrinsicBuilder>>>,
    index: usize,
) -> ExtrinsicResult<ExtrinsicBuilder> {
    let builders = built.await?;
    builders
        .get(index)
        .cloned()
        .ok_or_else(|| ExtrinsicError::Internal(format!("missing builder for index {}", index)))
}

/// Collect per-item results in index order
async fn aggregate<T>(
    mode: BatchErrorMode,
    items: Vec<Dependency<T>>,
) -> ExtrinsicResult<Vec<ExtrinsicResult<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    match mode {
        BatchErrorMode::FailFast => {
            let values = try_join_all(items).await?;
            Ok(values.into_iter().map(Ok).collect())
        }
        BatchErrorMode::PerItem => Ok(join_all(items).await),
    }
}

async fn build_single<B: BuildStrategy>(strategy: B) -> ExtrinsicResult<ExtrinsicBuilder> {
    run_blocking(move || {
        let builder = BuildStrategy::build(strategy, ExtrinsicBuilder::new())?;
        builder.validate()?;
        Ok(builder)
    })
    .await
}

async fn build_indexed<B: IndexedBuildStrategy>(
    strategy: B,
    count: NonZeroUsize,
) -> ExtrinsicResult<Arc<Vec<ExtrinsicBuilder>>> {
    let builders = run_blocking(move || {
        (0..count.get())
            .map(|index| -> ExtrinsicResult<ExtrinsicBuilder> {
                let builder = IndexedBuildStrategy::build(&strategy, ExtrinsicBuilder::new(), index)?;
                builder.validate()?;
                Ok(builder)
            })
            .collect::<ExtrinsicResult<Vec<_>>>()
    })
    .await?;
    Ok(Arc::new(builders))
}

/// Run caller-supplied build code off the async workers
async fn run_blocking<T, F>(build: F) -> ExtrinsicResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ExtrinsicResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(build).await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(ExtrinsicError::Cancelled),
        Err(_) => Err(ExtrinsicError::Builder("build strategy panicked".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ExtrinsicStatus, MockRpcEngine, StatusSubscription, WatchPolicy};
    use crate::coordination::scheduler::{ManualScheduler, Scheduler};
    use crate::runtime::MockMetadataProvider;
    use crate::signer::MockSigner;
    use crate::tx::{Call, DispatchClass, Weight};
    use futures::stream::{self, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const ACCOUNT: AccountId = [0x11; 32];

    fn metadata() -> RuntimeMetadata {
        RuntimeMetadata::new(1_002_000, 26, [0xaa; 32])
            .with_call("Balances", "transfer_keep_alive", 5, 3)
            .with_call("Utility", "batch_all", 26, 2)
    }

    fn metadata_provider() -> Arc<dyn MetadataProvider> {
        let mut provider = MockMetadataProvider::new();
        provider
            .expect_fetch_metadata()
            .returning(|| Ok(Arc::new(metadata())));
        Arc::new(provider)
    }

    fn signer() -> Arc<dyn Signer> {
        let mut signer = MockSigner::new();
        signer.expect_account_id().return_const(ACCOUNT);
        signer.expect_crypto_type().return_const(CryptoType::Sr25519);
        signer
            .expect_sign()
            .returning(|_| MultiSignature::new(CryptoType::Sr25519, vec![0x5a; 64]));
        Arc::new(signer)
    }

    fn fee(partial_fee: u128) -> FeeInfo {
        FeeInfo {
            weight: Weight::V2 {
                ref_time: 1_000,
                proof_size: 64,
            },
            class: DispatchClass::Normal,
            partial_fee,
        }
    }

    fn transfer(builder: ExtrinsicBuilder) -> ExtrinsicResult<ExtrinsicBuilder> {
        Ok(builder
            .adding_call(Call::new("Balances", "transfer_keep_alive", vec![1, 2, 3]))
            .with_nonce(7))
    }

    fn factory(engine: MockRpcEngine, config: ExtrinsicConfig) -> ExtrinsicOperationFactory {
        ExtrinsicOperationFactory::new(
            ACCOUNT,
            CryptoType::Sr25519,
            metadata_provider(),
            Arc::new(engine),
            config,
        )
    }

    async fn run<T: Send + 'static>(graph: TaskGraph<T>) -> ExtrinsicResult<T> {
        let (units, completion) = graph.into_parts();
        for unit in units {
            tokio::spawn(unit.into_future());
        }
        completion.outcome().await
    }

    fn count(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_fee_graph_queries_zero_signed_extrinsic() {
        let builder = transfer(ExtrinsicBuilder::new()).unwrap();
        let expected = codec::to_hex(
            &codec::encode_signed(
                &metadata(),
                &builder,
                &ACCOUNT,
                &MultiSignature::zeroed(CryptoType::Sr25519),
            )
            .unwrap(),
        );

        let mut engine = MockRpcEngine::new();
        engine
            .expect_query_fee()
            .withf(move |hex| hex == expected)
            .times(1)
            .returning(|_| Ok(fee(150)));
        engine.expect_submit().never();
        engine.expect_submit_and_watch().never();

        let graph = factory(engine, ExtrinsicConfig::default()).estimate_fee_graph(transfer);
        assert_eq!(graph.unit_names(), vec!["metadata", "build", "encode", "query_fee"]);
        assert_eq!(run(graph).await.unwrap(), fee(150));
    }

    #[tokio::test]
    async fn test_fee_graph_surfaces_builder_error() {
        let mut engine = MockRpcEngine::new();
        engine.expect_query_fee().never();

        let strategy = |_: ExtrinsicBuilder| -> ExtrinsicResult<ExtrinsicBuilder> {
            Err(ExtrinsicError::Builder("insufficient balance".into()))
        };
        let err = run(factory(engine, ExtrinsicConfig::default()).estimate_fee_graph(strategy))
            .await
            .unwrap_err();
        assert_eq!(err, ExtrinsicError::Builder("insufficient balance".into()));
    }

    #[tokio::test]
    async fn test_empty_builder_is_rejected_before_encoding() {
        let mut engine = MockRpcEngine::new();
        engine.expect_query_fee().never();

        let strategy = |builder: ExtrinsicBuilder| -> ExtrinsicResult<ExtrinsicBuilder> { Ok(builder) };
        let err = run(factory(engine, ExtrinsicConfig::default()).estimate_fee_graph(strategy))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtrinsicError::Builder(_)));
    }

    #[tokio::test]
    async fn test_fee_batch_preserves_index_order() {
        let mut engine = MockRpcEngine::new();
        engine.expect_query_fee().times(3).returning(|hex| {
            // The fee depends on the encoded call, so order mismatches show up.
            Ok(fee(hex.len() as u128))
        });

        let strategy = |builder: ExtrinsicBuilder, index: usize| -> ExtrinsicResult<ExtrinsicBuilder> {
            Ok(builder.adding_call(Call::new(
                "Balances",
                "transfer_keep_alive",
                vec![0u8; index * 4],
            )))
        };
        let results = run(factory(engine, ExtrinsicConfig::default())
            .estimate_fee_batch_graph(strategy, count(3)))
        .await
        .unwrap();

        let fees: Vec<u128> = results.into_iter().map(|r| r.unwrap().partial_fee).collect();
        assert_eq!(fees.len(), 3);
        assert!(fees[0] < fees[1] && fees[1] < fees[2]);
    }

    #[tokio::test]
    async fn test_fee_batch_builder_failure_fails_graph() {
        let mut engine = MockRpcEngine::new();
        engine.expect_query_fee().never();

        let strategy = |builder: ExtrinsicBuilder, index: usize| -> ExtrinsicResult<ExtrinsicBuilder> {
            if index == 3 {
                return Err(ExtrinsicError::Builder("bad amount".into()));
            }
            transfer(builder)
        };
        let err = run(factory(engine, ExtrinsicConfig::default())
            .estimate_fee_batch_graph(strategy, count(5)))
        .await
        .unwrap_err();
        assert_eq!(err, ExtrinsicError::Builder("bad amount".into()));
    }

    #[tokio::test]
    async fn test_submission_graph_returns_node_hash() {
        let mut engine = MockRpcEngine::new();
        engine
            .expect_submit()
            .times(1)
            .returning(|_| Ok(ExtrinsicHash::new("0xABCdef0123")));
        engine.expect_query_fee().never();

        let graph = factory(engine, ExtrinsicConfig::default()).submission_graph(transfer, signer());
        assert_eq!(graph.unit_names(), vec!["metadata", "build", "sign", "submit"]);
        assert_eq!(run(graph).await.unwrap().as_str(), "0xABCdef0123");
    }

    #[tokio::test]
    async fn test_signature_scheme_mismatch_is_signing_error() {
        let mut engine = MockRpcEngine::new();
        engine.expect_submit().never();

        let mut signer = MockSigner::new();
        signer.expect_account_id().return_const(ACCOUNT);
        signer.expect_crypto_type().return_const(CryptoType::Sr25519);
        signer
            .expect_sign()
            .returning(|_| MultiSignature::new(CryptoType::Ecdsa, vec![1; 65]));

        let err = run(factory(engine, ExtrinsicConfig::default())
            .submission_graph(transfer, Arc::new(signer) as Arc<dyn Signer>))
        .await
        .unwrap_err();
        assert!(matches!(err, ExtrinsicError::Signing(_)));
    }

    fn watch_engine(statuses: Vec<ExtrinsicStatus>, unsubscribed: Arc<AtomicUsize>) -> MockRpcEngine {
        let mut engine = MockRpcEngine::new();
        engine.expect_submit().never();
        engine.expect_submit_and_watch().times(1).returning(move |_| {
            Ok(StatusSubscription {
                id: "sub-1".to_string(),
                events: stream::iter(statuses.clone().into_iter().map(Ok)).boxed(),
            })
        });
        engine
            .expect_unsubscribe()
            .withf(|id| id == "sub-1")
            .times(1)
            .returning(move |_| {
                unsubscribed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        engine
    }

    #[tokio::test]
    async fn test_watch_resolves_with_local_hash_and_unsubscribes() {
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let engine = watch_engine(
            vec![
                ExtrinsicStatus::Ready,
                ExtrinsicStatus::InBlock("0xb1".into()),
                ExtrinsicStatus::Finalized("0xb1".into()),
            ],
            unsubscribed.clone(),
        );

        let builder = transfer(ExtrinsicBuilder::new()).unwrap();
        let expected = codec::extrinsic_hash(
            &codec::encode_signed(
                &metadata(),
                &builder,
                &ACCOUNT,
                &MultiSignature::new(CryptoType::Sr25519, vec![0x5a; 64]).unwrap(),
            )
            .unwrap(),
        );

        let hash = run(factory(engine, ExtrinsicConfig::default()).watch_submission_graph(transfer, signer()))
            .await
            .unwrap();
        assert_eq!(hash, expected);
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_terminal_failure_still_unsubscribes() {
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let engine = watch_engine(
            vec![ExtrinsicStatus::Ready, ExtrinsicStatus::Invalid],
            unsubscribed.clone(),
        );

        let err = run(factory(engine, ExtrinsicConfig::default()).watch_submission_graph(transfer, signer()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExtrinsicError::TerminalStatus {
                status: "invalid".into()
            }
        );
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_times_out() {
        let mut engine = MockRpcEngine::new();
        engine.expect_submit_and_watch().returning(|_| {
            Ok(StatusSubscription {
                id: "sub-9".to_string(),
                events: stream::pending().boxed(),
            })
        });
        engine.expect_unsubscribe().times(1).returning(|_| Ok(()));

        let config = ExtrinsicConfig {
            watch_policy: WatchPolicy::Finalized,
            watch_timeout_secs: 1,
            ..ExtrinsicConfig::default()
        };
        let graph = factory(engine, config).watch_submission_graph(transfer, signer());
        let err = tokio::time::timeout(Duration::from_secs(10), run(graph))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ExtrinsicError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_watch_cancelled_mid_watch_unsubscribes_once() {
        let (watching_tx, mut watching_rx) = tokio::sync::mpsc::unbounded_channel();
        let (unsubscribed_tx, mut unsubscribed_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut engine = MockRpcEngine::new();
        engine.expect_submit_and_watch().times(1).returning(move |_| {
            let _ = watching_tx.send(());
            Ok(StatusSubscription {
                id: "sub-5".to_string(),
                events: stream::pending().boxed(),
            })
        });
        engine
            .expect_unsubscribe()
            .withf(|id| id == "sub-5")
            .times(1)
            .returning(move |id| {
                let _ = unsubscribed_tx.send(id.to_string());
                Ok(())
            });

        let scheduler = ManualScheduler::new();
        let graph = factory(engine, ExtrinsicConfig::default()).watch_submission_graph(transfer, signer());
        let (units, completion) = graph.into_parts();
        scheduler.enqueue(units);
        scheduler.release_all();

        tokio::time::timeout(Duration::from_secs(5), watching_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.cancel_all(), 1);
        assert_eq!(completion.outcome().await, Err(ExtrinsicError::Cancelled));

        let closed = tokio::time::timeout(Duration::from_secs(5), unsubscribed_rx.recv())
            .await
            .unwrap();
        assert_eq!(closed.as_deref(), Some("sub-5"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(unsubscribed_rx.try_recv().is_err());
    }

    fn counting_submits(submits: Arc<AtomicUsize>) -> MockRpcEngine {
        let mut engine = MockRpcEngine::new();
        engine.expect_submit().returning(move |hex| {
            submits.fetch_add(1, Ordering::SeqCst);
            // The call arguments close the extrinsic; argument 0x01 is rejected.
            let tail = &hex[hex.len() - 2..];
            if tail == "01" {
                return Err(ExtrinsicError::NodeRejection {
                    code: Some(1014),
                    message: "Priority is too low".into(),
                });
            }
            Ok(ExtrinsicHash::new(format!("0xhash{}", tail)))
        });
        engine
    }

    fn indexed_transfer(builder: ExtrinsicBuilder, index: usize) -> ExtrinsicResult<ExtrinsicBuilder> {
        Ok(builder
            .adding_call(Call::new("Balances", "transfer_keep_alive", vec![index as u8]))
            .with_nonce(index as u32))
    }

    #[tokio::test]
    async fn test_batch_node_rejection_stays_in_its_slot() {
        for mode in [BatchErrorMode::FailFast, BatchErrorMode::PerItem] {
            let submits = Arc::new(AtomicUsize::new(0));
            let config = ExtrinsicConfig {
                batch_errors: mode,
                ..ExtrinsicConfig::default()
            };
            let results = run(factory(counting_submits(submits.clone()), config)
                .submission_batch_graph(indexed_transfer, signer(), count(3)))
            .await
            .unwrap();

            assert_eq!(submits.load(Ordering::SeqCst), 3);
            assert_eq!(results[0], Ok(ExtrinsicHash::new("0xhash00")));
            assert_eq!(
                results[1],
                Err(ExtrinsicError::NodeRejection {
                    code: Some(1014),
                    message: "Priority is too low".into(),
                })
            );
            assert_eq!(results[2], Ok(ExtrinsicHash::new("0xhash02")));
        }
    }

    #[tokio::test]
    async fn test_batch_builder_failure_broadcasts_nothing() {
        for mode in [BatchErrorMode::FailFast, BatchErrorMode::PerItem] {
            let submits = Arc::new(AtomicUsize::new(0));
            let strategy = |builder: ExtrinsicBuilder, index: usize| -> ExtrinsicResult<ExtrinsicBuilder> {
                if index == 1 {
                    return Err(ExtrinsicError::Builder("nonce gap".into()));
                }
                indexed_transfer(builder, index)
            };
            let config = ExtrinsicConfig {
                batch_errors: mode,
                ..ExtrinsicConfig::default()
            };
            let err = run(factory(counting_submits(submits.clone()), config)
                .submission_batch_graph(strategy, signer(), count(3)))
            .await
            .unwrap_err();

            assert_eq!(err, ExtrinsicError::Builder("nonce gap".into()));
            assert_eq!(submits.load(Ordering::SeqCst), 0);
        }
    }

    /// Signer whose second signature fails
    fn flaky_signer() -> Arc<dyn Signer> {
        let calls = AtomicUsize::new(0);
        let mut signer = MockSigner::new();
        signer.expect_account_id().return_const(ACCOUNT);
        signer.expect_crypto_type().return_const(CryptoType::Sr25519);
        signer.expect_sign().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(ExtrinsicError::Signing("device disconnected".into()));
            }
            MultiSignature::new(CryptoType::Sr25519, vec![0x5a; 64])
        });
        Arc::new(signer)
    }

    #[tokio::test]
    async fn test_batch_signing_failure_fail_fast_broadcasts_nothing() {
        let submits = Arc::new(AtomicUsize::new(0));
        let err = run(factory(counting_submits(submits.clone()), ExtrinsicConfig::default())
            .submission_batch_graph(indexed_transfer, flaky_signer(), count(3)))
        .await
        .unwrap_err();

        assert_eq!(err, ExtrinsicError::Signing("device disconnected".into()));
        assert_eq!(submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_signing_failure_per_item() {
        let submits = Arc::new(AtomicUsize::new(0));
        let config = ExtrinsicConfig {
            batch_errors: BatchErrorMode::PerItem,
            ..ExtrinsicConfig::default()
        };
        let results = run(factory(counting_submits(submits.clone()), config)
            .submission_batch_graph(indexed_transfer, flaky_signer(), count(3)))
        .await
        .unwrap();

        assert_eq!(results.len(), 3);
        let signing_failures = results
            .iter()
            .filter(|r| **r == Err(ExtrinsicError::Signing("device disconnected".into())))
            .count();
        assert_eq!(signing_failures, 1);
        assert_eq!(submits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_metadata_failure_is_shared_in_per_item_mode() {
        let mut provider = MockMetadataProvider::new();
        provider
            .expect_fetch_metadata()
            .times(1)
            .returning(|| Err(ExtrinsicError::MetadataUnavailable("not synced".into())));
        let mut engine = MockRpcEngine::new();
        engine.expect_submit().never();

        let factory = ExtrinsicOperationFactory::new(
            ACCOUNT,
            CryptoType::Sr25519,
            Arc::new(provider),
            Arc::new(engine),
            ExtrinsicConfig {
                batch_errors: BatchErrorMode::PerItem,
                ..ExtrinsicConfig::default()
            },
        );
        let err = run(factory.submission_batch_graph(|b: ExtrinsicBuilder, _: usize| transfer(b), signer(), count(4)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtrinsicError::MetadataUnavailable(_)));
    }
}
