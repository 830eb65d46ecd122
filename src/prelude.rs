//! Everything needed to write a load test, importable with `use loadtree::prelude::*;`.

pub use crate::config::{LoadTestConfiguration, LoadTestDefault, LoadTestDefaultType};
pub use crate::statistics::StatisticsSnapshot;
pub use crate::task::{
    SelectionStrategy, TaskError, TaskNode, TaskOptions, TaskResult, TaskTree,
};
pub use crate::user::{UserBehavior, UserFactory, UserStorage, VirtualUser};
pub use crate::{task, LoadTest, LoadTestError, LoadTestHandle, LoadTestStatus};
