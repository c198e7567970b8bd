//! # Exemple d'Entraînement Linéaire + Softmax sur Deux Files Accélérateur
//!
//! Cet exemple illustre le cœur asynchrone de `fluxrust-core` en entraînant
//! un classifieur linéaire réparti sur deux files d'exécution.
//!
//! ## Fonctionnalités Démontrées:
//! 1.  **Initialisation du Registre des Périphériques** (`registry::init`).
//! 2.  **Création de Contextes**: files ordonnées et asynchrones, une par
//!     périphérique.
//! 3.  **Câblage du Graphe par `Connector`**: les données sur le premier
//!     périphérique, le bloc de perte sur le second — l'ordre inter-files
//!     est garanti par les arêtes `wait`/`block`, jamais par un verrou global.
//! 4.  **Boucle d'Entraînement Manuelle**:
//!     -   Passes avant (`fprop`) et arrière (`bprop`), purement asynchrones.
//!     -   Mise à jour SGD (`SgdStep::notify`).
//!     -   Lecture de la perte via les rappels de complétion d'un contexte
//!         d'évaluation (`calculate_loss` + `synchronize`).
//!
//! ## Exécution
//! Pour exécuter cet exemple, utilisez la commande :
//! `cargo run --example linear_softmax_two_devices`
//!

use fluxrust_core::nn::{Block, DotBlock, SoftmaxCeBlock};
use fluxrust_core::optim::{FixedRate, SgdStep};
use fluxrust_core::{registry, Buffer, Connector, Context, Device, FluxRustError, HostMatrix};

fn main() -> Result<(), FluxRustError> {
    env_logger::init();
    registry::init(2)?;

    // Deux classes séparables: la classe est décidée par le signe de la
    // première caractéristique.
    let batch = 8;
    let features = 4;
    let classes = 2;
    let x_host = HostMatrix::from_fn(batch, features, |i, j| {
        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
        sign * (1.0 + (j as f32) * 0.25) + (i as f32) * 0.01
    });
    let labels_host = HostMatrix::from_fn(batch, 1, |i, _| (i % 2) as i32);

    // Les données vivent sur le périphérique 0, la perte sur le 1.
    let x_ctx = Context::new(Device::Accel(0))?;
    let x_value = Buffer::from_host(Device::Accel(0), &x_host)?;
    let x_edge = Connector::new(x_value, x_ctx.clone());

    let labels_ctx = Context::new(Device::Accel(0))?;
    let labels_value = Buffer::from_host(Device::Accel(0), &labels_host)?;
    let labels_edge = Connector::new(labels_value, labels_ctx.clone());

    let weight_init = HostMatrix::from_fn(features, classes, |i, j| {
        ((i + 2 * j) % 3) as f32 * 0.05 - 0.05
    });
    let mut dot = DotBlock::new(&weight_init, &x_edge, Device::Accel(0))?;
    let mut loss_block = SoftmaxCeBlock::new(dot.output(), &labels_edge, None, Device::Accel(1))?;
    let step = SgdStep::new(dot.params(), FixedRate::new(0.1))?;
    let eval = Context::new(Device::Cpu)?;

    println!("Entraînement: {} itérations, lot de {}", 20, batch);
    for epoch in 0..20 {
        x_edge.fprop()?;
        labels_edge.fprop()?;
        dot.fprop()?;
        loss_block.fprop()?;

        loss_block.calculate_loss(&eval);
        loss_block.bprop()?;
        dot.bprop()?;
        step.notify()?;

        // Seul point bloquant de l'itération: le drain du contexte
        // d'évaluation, qui exécute le rappel de perte.
        eval.synchronize();
        if let Some(loss) = loss_block.loss() {
            println!("itération {:2}: perte = {:.6}", epoch, loss);
        }
    }

    Ok(())
}
