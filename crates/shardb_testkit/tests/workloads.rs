//! Generated workloads checked against a model, across restarts.

use proptest::prelude::*;
use shardb_testkit::{shard_ops_strategy, ShardModel, TestShard};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn committed_documents_survive_any_workload(ops in shard_ops_strategy(24)) {
        let mut shard = TestShard::new();
        let model = ShardModel::run(&mut shard, "docs", &ops);
        let docs = shard.storage("docs");
        model.check(&shard, docs);

        shard.reopen();
        model.check(&shard, docs);
    }
}
