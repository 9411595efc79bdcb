use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use yukkuri_workflow_core::engine::WorkflowEngine;
use yukkuri_workflow_core::step::{DataMap, StepDefinition, StepExecutionContext, StepProcessor, StepResult};

/// A step processor that just stamps its own name into the output map,
/// standing in for a real render/transcode/mux stage.
struct DemoStep {
    name: String,
}

#[async_trait]
impl StepProcessor for DemoStep {
    fn execute(&self, context: &StepExecutionContext, input: &DataMap) -> anyhow::Result<StepResult> {
        let mut output = input.clone();
        output.insert(context.step_name.clone(), Value::String(format!("{} ran", self.name)));
        Ok(StepResult::success(output, Duration::from_millis(10)))
    }

    fn clone_processor(&self) -> Arc<dyn StepProcessor> {
        Arc::new(DemoStep { name: self.name.clone() })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let engine = WorkflowEngine::new(3, Duration::from_secs(30));

    let steps = vec![
        StepDefinition::new(1, "script", "Script"),
        StepDefinition::new(2, "audio", "Audio").with_dependencies(["script"]),
        StepDefinition::new(3, "visuals", "Visuals").with_dependencies(["script"]),
        StepDefinition::new(4, "render", "Render").with_dependencies(["audio", "visuals"]),
    ];

    for step in &steps {
        engine
            .register_step_processor(step.name.clone(), Arc::new(DemoStep { name: step.name.clone() }))
            .await;
    }
    engine.register_workflow("demo-video", steps).await?;

    let plan = engine.plan_execution("demo-video", "proj-demo").await?;
    println!("planned phases: {:?}", plan.phases);

    let result = engine.execute_workflow("demo-video", "proj-demo", DataMap::new()).await?;
    println!(
        "workflow finished: status={} completed={} failed={} duration={:.3}s",
        result.status, result.completed_steps, result.failed_steps, result.duration_secs
    );

    Ok(())
}
