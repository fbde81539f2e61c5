//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Hayes modem dial script

use crate::{ChannelError, ChannelIo, ChannelResult, DialerConfig, PatternMatcher};
use metrics::counter;
use tracing::{debug, info, warn};

/// Final result codes that end a dial attempt without a connection
const DIAL_FAILURES: [&str; 4] = ["NO CARRIER", "BUSY", "NO DIALTONE", "NO ANSWER"];

/// Runs the reset and dial exchange on a connected serial channel
#[derive(Debug, Clone, Default)]
pub struct ModemDialer {
    config: DialerConfig,
}

impl ModemDialer {
    /// Create a dialer
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    /// The dialer settings
    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Reset the modem and dial `number`
    ///
    /// Succeeds once the modem reports `CONNECT`. Any other final result, or
    /// silence past the configured timeouts, is a [`ChannelError::Dial`].
    pub async fn dial(&self, io: &mut ChannelIo, number: &str) -> ChannelResult<()> {
        io.send_line(&self.config.init_command).await?;
        let mut reset = [PatternMatcher::new("OK"), PatternMatcher::new("ERROR")];
        match io.reader().wait_for(self.config.reset_timeout, &mut reset).await {
            Some(0) => debug!(channel = %io.reader().name(), "Modem reset"),
            Some(_) => return Err(self.fail(io, "modem rejected reset")),
            None => return Err(self.fail(io, "modem did not answer reset")),
        }

        io.send_line(&format!("{}{}", self.config.dial_prefix, number))
            .await?;

        let mut outcomes = Vec::with_capacity(DIAL_FAILURES.len() + 1);
        outcomes.push(PatternMatcher::new("CONNECT"));
        outcomes.extend(DIAL_FAILURES.iter().map(|code| PatternMatcher::new(*code)));

        match io.reader().wait_for(self.config.dial_timeout, &mut outcomes).await {
            Some(0) => {
                info!(channel = %io.reader().name(), number, "Modem connected");
                counter!("fieldpoll.channels.dial_success").increment(1);
                Ok(())
            }
            Some(index) => Err(self.fail(io, DIAL_FAILURES[index - 1])),
            None => Err(self.fail(io, "no answer before dial timeout")),
        }
    }

    fn fail(&self, io: &ChannelIo, reason: &str) -> ChannelError {
        warn!(channel = %io.reader().name(), reason, "Dial failed");
        counter!("fieldpoll.channels.dial_failure").increment(1);
        ChannelError::Dial(reason.to_string())
    }
}
