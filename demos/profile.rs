//! Simulates users browsing and editing a profile.
//!
//! Each user logs in once as it spawns, then mostly views its profile, occasionally
//! edits it, and now and then steps out of the profile section to walk through the
//! help pages in order.
//!
//! ```bash
//! cargo run --example profile -- -u 20 -r 5 -t 1m --min-sleep 0 --max-sleep 1
//! ```
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

use loadtree::prelude::*;
use rand::Rng;
use std::time::Duration;

fn main() -> Result<(), LoadTestError> {
    LoadTest::initialize()?
        .register_entry(
            // The entry function runs once, when each user spawns.
            task!(login)
                .set_name("root")
                .register_section("profile", |profile| {
                    profile
                        // Leave the profile section about once every twelve selections.
                        .set_step_out_weight(1)
                        .register_task(task!(view_profile).set_name("view").set_weight(10))
                        .register_task(task!(edit_profile).set_name("edit").set_weight(1))
                })
                .register_section("help", |help| {
                    help.set_strategy(SelectionStrategy::InOrder)
                        .register_task(task!(read_help).set_name("contents"))
                        .register_task(task!(read_help).set_name("faq"))
                        .register_task(task!(read_help).set_name("contact"))
                }),
        )
        .set_default(LoadTestDefault::MaxSleep, 2)?
        .execute()?;

    Ok(())
}

// Stands in for a request taking between `min` and `max` milliseconds.
async fn pretend_request(min: u64, max: u64) {
    let millis = rand::rng().random_range(min..max);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

async fn login(user: &mut VirtualUser) -> TaskResult {
    pretend_request(50, 150).await;
    user.storage.set("session", format!("session-{}", user.id));
    user.storage.set("views", 0_i64);

    Ok(())
}

async fn view_profile(user: &mut VirtualUser) -> TaskResult {
    pretend_request(5, 40).await;
    let views = user.storage.get_int("views")?;
    user.storage.set("views", views + 1);

    Ok(())
}

async fn edit_profile(user: &mut VirtualUser) -> TaskResult {
    // Only logged in users can edit.
    user.storage.get_string("session")?;
    pretend_request(20, 120).await;

    // Profiles that haven't been viewed yet can't be edited.
    if user.storage.get_int("views")? == 0 {
        return Err("nothing to edit".into());
    }
    Ok(())
}

async fn read_help(_user: &mut VirtualUser) -> TaskResult {
    pretend_request(5, 20).await;

    Ok(())
}
