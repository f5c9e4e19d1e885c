//! Networks, optimizer, losses and latent sampling used by the training loop.

pub mod latent;
pub mod loss;
pub mod model;
pub mod optim;

pub use latent::LatentSampler;
pub use loss::{DiscriminatorLoss, binary_cross_entropy, discriminator_loss, generator_loss};
pub use model::{Discriminator, Generator, Mode, Model, parameter_digest};
pub use optim::{Adam, AdamParams, Optimizer};
