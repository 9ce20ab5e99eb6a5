// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use admission::AdmissionController;
pub use app_error::{AppError, AppResult};
pub use config::{
    EncryptionConfig, EncryptionMode, NetworkConfig, PoolLimits, PoolsConfig, RequestHandlerPool,
    TransportConfig,
};
pub use events::{EventHub, EventListener, TransportEvent};
pub use server::{DispatchTask, IoContext};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};
pub use transport::{DataHandler, HandlerFuture, Transport};

mod admission;
mod app_error;
mod config;
mod events;
mod server;
mod shutdown;
mod tracing_config;
mod transport;
