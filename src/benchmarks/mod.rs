mod build;
pub use build::{
    pkg_to_test_bin, test_bin_to_pkg, BazelBuilder, BuildBackend, Checkout, GoList,
    GoTestBuilder, PackageLister, BAZEL_DIR_SUFFIX, DEFAULT_IMPORT_ROOT,
};
mod fingerprint;
pub use fingerprint::Fingerprint;
pub mod profiles;
pub use profiles::{PprofMerger, ProfileKind, ProfileMerge, ProfileSelection};
mod runner;
pub use runner::{
    bench_args, probe_logtostderr, Orchestrator, RunOptions, SoftFailure,
    BENCHMARK_FAILURE_EXIT_CODE,
};
mod suite;
pub use suite::{intersect_tests, Suite, SuiteBuilder, TestSet};
