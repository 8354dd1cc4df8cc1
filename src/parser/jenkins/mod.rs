//! Jenkins declarative pipeline parser.

mod lexer;
mod lower;
mod syntax;

use super::{document_error, DialectParser};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::ir::PipelineGraph;
use crate::vendor::Vendor;

pub struct JenkinsParser;

impl DialectParser for JenkinsParser {
    fn vendor(&self) -> Vendor {
        Vendor::Jenkins
    }

    fn parse_document(&self, text: &str, diagnostics: &mut Diagnostics) -> Result<PipelineGraph> {
        let nodes = syntax::parse(text).map_err(|message| document_error(self.vendor(), message))?;
        lower::lower(&nodes, diagnostics).map_err(|message| document_error(self.vendor(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticKind;
    use crate::ir::Conditional;

    const JENKINSFILE: &str = r#"
pipeline {
    agent { docker { image 'maven:3.9' } }
    environment {
        APP = 'shop'
        DEPLOY_TOKEN = credentials('deploy-token')
    }
    options {
        timeout(time: 1, unit: 'HOURS')
    }
    triggers {
        cron('H 4 * * 1-5')
    }
    stages {
        stage('Build') {
            steps {
                sh 'mvn -B package -Dbuild=$BUILD_NUMBER'
                archiveArtifacts artifacts: 'target/*.jar'
            }
        }
        stage('Checks') {
            parallel {
                stage('Unit') {
                    steps { sh 'mvn test' }
                }
                stage('Lint') {
                    steps { sh 'mvn checkstyle:check' }
                }
            }
        }
        stage('Deploy') {
            when { branch 'main' }
            input {
                message 'Ship it?'
            }
            steps {
                retry(3) {
                    sh "./deploy.sh ${env.APP}"
                }
            }
        }
    }
}
"#;

    #[test]
    fn test_stages_become_edges() {
        let output = JenkinsParser.parse(JENKINSFILE);
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let graph = output.graph;
        let ids: Vec<&str> = graph.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["build", "unit", "lint", "deploy"]);
        assert_eq!(graph.jobs[1].dependency_ids().collect::<Vec<_>>(), vec!["build"]);
        assert_eq!(graph.jobs[2].dependency_ids().collect::<Vec<_>>(), vec!["build"]);
        assert_eq!(graph.jobs[3].dependency_ids().collect::<Vec<_>>(), vec!["unit", "lint"]);
    }

    #[test]
    fn test_pipeline_settings_flow_into_jobs() {
        let graph = JenkinsParser.parse(JENKINSFILE).graph;
        let build = &graph.jobs[0];
        assert_eq!(build.container.as_ref().map(|c| c.image.as_str()), Some("maven:3.9"));
        assert_eq!(build.commands, vec!["mvn -B package -Dbuild=$BUILDKITE_BUILD_NUMBER"]);
        assert_eq!(build.artifacts.produces, vec!["target/*.jar"]);
        assert_eq!(build.secrets, vec!["DEPLOY_TOKEN"]);
        assert_eq!(build.timeout_minutes, Some(60));
        assert_eq!(graph.schedules.len(), 1);
        assert_eq!(graph.environment.get("APP").map(String::as_str), Some("shop"));
    }

    #[test]
    fn test_deploy_stage() {
        let graph = JenkinsParser.parse(JENKINSFILE).graph;
        let deploy = &graph.jobs[3];
        assert_eq!(deploy.conditionals, vec![Conditional::only_branches(vec!["main".to_string()])]);
        assert_eq!(
            deploy.approval.as_ref().and_then(|a| a.prompt.as_deref()),
            Some("Ship it?")
        );
        assert_eq!(deploy.retry.as_ref().map(|r| r.max_attempts), Some(3));
        assert_eq!(deploy.commands, vec!["./deploy.sh ${APP}"]);
    }

    #[test]
    fn test_stage_without_steps_is_placeholder() {
        let source = "pipeline {\n agent any\n stages {\n  stage('a') { steps { sh 'a' } }\n  stage('b') { }\n  stage('c') { steps { sh 'c' } }\n }\n}";
        let output = JenkinsParser.parse(source);
        assert_eq!(output.graph.jobs.len(), 3);
        assert!(output.graph.jobs[1].is_unsupported());
        assert_eq!(output.graph.jobs[1].dependency_ids().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(output.graph.jobs[2].dependency_ids().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(output.diagnostics.of_kind(DiagnosticKind::Parse).count(), 1);
    }

    #[cfg(test)]
    mod stage_isolation {
        use super::*;

        #[test]
        fn slashy_regex_in_expression_is_kept() {
            let source = r#"pipeline {
  agent any
  stages {
    stage('a') { steps { sh 'a' } }
    stage('b') {
      when { expression { env.BRANCH_NAME ==~ /release\/.*/ } }
      steps { sh 'b' }
    }
    stage('c') { steps { sh 'c' } }
  }
}"#;
            let output = JenkinsParser.parse(source);
            assert_eq!(output.diagnostics.of_kind(DiagnosticKind::Document).count(), 0);
            assert_eq!(output.graph.jobs.len(), 3, "Should keep every stage");
            let b = &output.graph.jobs[1];
            assert!(!b.is_unsupported());
            assert_eq!(b.commands, vec!["b"]);
            assert!(
                matches!(b.conditionals.as_slice(), [Conditional::Expression { source }] if source.contains("release")),
                "Should keep the Groovy condition as an expression: {:?}",
                b.conditionals
            );
        }

        #[test]
        fn syntax_error_stubs_only_its_stage() {
            let source = "pipeline {\n agent any\n stages {\n  stage('a') { steps { sh 'a' } }\n  stage('b') {\n   steps {\n    sh 'b'\n    = broken\n   }\n  }\n  stage('c') { steps { sh 'c' } }\n }\n}";
            let output = JenkinsParser.parse(source);
            let ids: Vec<&str> = output.graph.jobs.iter().map(|j| j.id.as_str()).collect();
            assert_eq!(ids, vec!["a", "b", "c"]);
            assert!(!output.graph.jobs[0].is_unsupported());
            assert!(output.graph.jobs[1].is_unsupported(), "Should stub the broken stage");
            assert!(!output.graph.jobs[2].is_unsupported());
            assert_eq!(output.graph.jobs[2].dependency_ids().collect::<Vec<_>>(), vec!["b"]);
            assert_eq!(output.diagnostics.of_kind(DiagnosticKind::Parse).count(), 1);
            assert_eq!(output.diagnostics.of_kind(DiagnosticKind::Document).count(), 0);
        }
    }

    #[test]
    fn test_scripted_pipeline_is_document_error() {
        let output = JenkinsParser.parse("node {\n  sh 'make'\n}");
        assert!(output.graph.jobs.is_empty());
        assert_eq!(output.diagnostics.of_kind(DiagnosticKind::Document).count(), 1);
    }
}
